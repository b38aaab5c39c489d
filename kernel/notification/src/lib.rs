//! Topic-based publish/subscribe notifications.
//!
//! A [`Topic`] is a bounded, lock-free queue of boxed notifications plus the
//! set of subscribers interested in it. [`NotificationStream`] owns the set
//! of topics and the [`rcu::Domain`] every published notification is bound
//! to: a notification's heap allocation is only reclaimed once every reader
//! that observed it through [`Topic::process`] has quiesced, so a subscriber
//! can hold a borrowed reference past the point where the topic has moved on
//! without the usual shared/weak pointer bookkeeping.

#![no_std]

extern crate alloc;

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use kernel_errors::{Error, Result};
use rcu::{Domain, RcuArc};
use spin::Once;
use sync::IrqSafeRwLock;
use uuid::Uuid;

/// Something that can be published onto a [`Topic`].
///
/// Implementors are moved onto the heap and wrapped in an [`RcuArc`] at
/// publish time; there is no requirement that two notifications on the same
/// topic share a concrete type.
pub trait Notification: Send + Sync + 'static {
    /// A tick count (e.g. TSC or a monotonic counter) stamped by the caller
    /// at construction time. Not interpreted by this crate.
    fn instant(&self) -> u64;
}

/// Registered against a [`Topic`]; invoked once per notification in
/// enqueue order, synchronously, from whichever core calls
/// [`NotificationStream::process`] or [`NotificationStream::process_all`].
///
/// `notify` must not call [`NotificationStream::publish`] on the same topic
/// it was invoked for — see the reentrancy guard documented on
/// [`Topic::process`].
pub trait Subscriber: Send + Sync {
    fn notify(&self, topic: &Topic, notification: &RcuArc<Box<dyn Notification>>);
}

/// Opaque handle returned by [`NotificationStream::subscribe`], needed to
/// call [`NotificationStream::unsubscribe`] later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SubscriberId(u64);

/// One core's worth of APIC IDs; sized the same as the id itself (`u8`) so
/// the reentrancy-guard table below can be indexed directly without a lock.
const MAX_CORES: usize = 256;

pub struct Topic {
    id: Uuid,
    name: String,
    queue: mpmc::Queue<RcuArc<Box<dyn Notification>>>,
    subscribers: IrqSafeRwLock<Vec<(SubscriberId, Arc<dyn Subscriber>)>>,
    /// Set for the duration of a single notification's subscriber dispatch
    /// on the core doing the dispatching; lets `enqueue` detect a subscriber
    /// callback re-entering `publish` on this same topic, same call stack.
    dispatching: [AtomicBool; MAX_CORES],
}

impl Topic {
    fn new(id: Uuid, name: String, capacity: usize) -> Topic {
        Topic {
            id,
            name,
            queue: mpmc::Queue::with_capacity(capacity),
            subscribers: IrqSafeRwLock::new(Vec::new()),
            dispatching: core::array::from_fn(|_| AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn enqueue(&self, notification: RcuArc<Box<dyn Notification>>) -> Result<()> {
        let core = apic::my_apic_id() as usize;
        debug_assert!(
            !self.dispatching[core].load(Ordering::Acquire),
            "notification: a subscriber callback on topic {} re-entered publish()",
            self.name
        );
        self.queue
            .push(notification)
            .map_err(|_| Error::out_of_memory("notification: topic queue is at capacity"))
    }

    /// Dequeues up to `limit` notifications, delivering each to every
    /// current subscriber (read-locked fresh per notification, so an
    /// `unsubscribe` racing with `process` only affects notifications not
    /// yet dequeued) before moving on to the next.
    ///
    /// Checking `delivered < limit` before every dequeue — rather than
    /// dequeuing first and checking the count afterwards — is what makes
    /// `process(0)` a correct no-op instead of draining exactly one
    /// notification; callers (namely [`NotificationStream::process_all`])
    /// rely on that to avoid passing this a budget that has already been
    /// exhausted by an earlier topic.
    pub(crate) fn process(&self, limit: usize) -> usize {
        let core = apic::my_apic_id() as usize;
        let mut delivered = 0;
        while delivered < limit {
            let Some(notification) = self.queue.pop() else {
                break;
            };

            self.dispatching[core].store(true, Ordering::Release);
            {
                let subscribers = self.subscribers.read();
                for (_, subscriber) in subscribers.iter() {
                    subscriber.notify(self, &notification);
                }
            }
            self.dispatching[core].store(false, Ordering::Release);

            delivered += 1;
        }
        delivered
    }
}

/// Default budget handed to [`NotificationStream::process_all`] by callers
/// that don't otherwise need to bound it (e.g. a drain worker polled once
/// per tick).
pub const DEFAULT_PROCESS_LIMIT: usize = 1024;

pub struct NotificationStream {
    domain: Domain,
    topics: IrqSafeRwLock<BTreeMap<Uuid, Box<Topic>>>,
    next_subscriber_id: AtomicU64,
}

static STREAM: Once<NotificationStream> = Once::new();

/// The process-wide notification stream. Topics and subscriptions created
/// through it live for the rest of the kernel's uptime.
pub fn stream() -> &'static NotificationStream {
    STREAM.call_once(NotificationStream::new)
}

impl NotificationStream {
    fn new() -> NotificationStream {
        NotificationStream {
            domain: Domain::new(),
            topics: IrqSafeRwLock::new(BTreeMap::new()),
            next_subscriber_id: AtomicU64::new(0),
        }
    }

    pub fn domain(&self) -> &Domain {
        &self.domain
    }

    /// Idempotent on UUID collision: returns the existing topic rather than
    /// creating a second one.
    ///
    /// The capacity check this performs is purely the bounded queue's
    /// allocation; there is no reservation protocol here the way there is
    /// for the frame allocator, since `mpmc::Queue::with_capacity` has no
    /// fallible constructor to report an allocation failure through.
    pub fn create_topic(&self, id: Uuid, name: String, capacity: usize) -> Result<&'static Topic> {
        if let Some(existing) = self.find_topic(id) {
            return Ok(existing);
        }

        let mut topics = self.topics.write();
        let boxed = topics
            .entry(id)
            .or_insert_with(|| Box::new(Topic::new(id, name, capacity)));
        let ptr: *const Topic = &**boxed;
        drop(topics);

        let topic = unsafe { &*ptr };
        log::debug!("notification: created topic {}:{}", topic.name(), topic.id());
        Ok(topic)
    }

    pub fn find_topic(&self, id: Uuid) -> Option<&'static Topic> {
        let topics = self.topics.read();
        let boxed = topics.get(&id)?;
        let ptr: *const Topic = &**boxed;
        drop(topics);
        Some(unsafe { &*ptr })
    }

    pub fn subscribe(&self, topic: &'static Topic, subscriber: Arc<dyn Subscriber>) -> SubscriberId {
        let id = SubscriberId(self.next_subscriber_id.fetch_add(1, Ordering::Relaxed));
        topic.subscribers.write().push((id, subscriber));
        id
    }

    /// Pending notifications already dequeued by an in-flight `process`
    /// call still deliver to `id`; only notifications processed after this
    /// returns are guaranteed to skip it.
    pub fn unsubscribe(&self, topic: &'static Topic, id: SubscriberId) {
        topic.subscribers.write().retain(|(existing, _)| *existing != id);
    }

    /// Constructs `value` on the heap, binds it to this stream's RCU
    /// domain, and tries to enqueue it on `topic`. Never blocks: a full
    /// queue fails with [`kernel_errors::ErrorKind::OutOfMemory`] instead of
    /// waiting for room.
    pub fn publish<T: Notification>(&'static self, topic: &Topic, value: T) -> Result<()> {
        let boxed: Box<dyn Notification> = Box::new(value);
        let notification = RcuArc::new(&self.domain, boxed);
        topic.enqueue(notification)
    }

    pub fn process(&self, topic: &Topic, limit: usize) -> usize {
        let delivered = topic.process(limit);
        if delivered > 0 {
            self.domain.try_advance();
        }
        delivered
    }

    /// Round-robins every topic, each bounded to whatever remains of
    /// `limit` once earlier topics have taken their share.
    ///
    /// `limit.saturating_sub(delivered)` plus the early `break` above is
    /// deliberate: a topic is always called with a strictly positive
    /// remaining budget, so `Topic::process`'s `delivered < limit` loop
    /// guard never needs to see zero, and this can never underflow however
    /// many notifications an individual topic happens to deliver.
    pub fn process_all(&self, limit: usize) -> usize {
        let mut delivered = 0;
        let topics = self.topics.read();
        for topic in topics.values() {
            if delivered >= limit {
                break;
            }
            delivered += topic.process(limit.saturating_sub(delivered));
        }
        drop(topics);
        if delivered > 0 {
            self.domain.try_advance();
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicUsize;

    struct Ping(u64);

    impl Notification for Ping {
        fn instant(&self) -> u64 {
            self.0
        }
    }

    struct CountingSubscriber {
        seen: AtomicUsize,
        last: IrqSafeRwLock<u64>,
    }

    impl CountingSubscriber {
        fn new() -> Arc<CountingSubscriber> {
            Arc::new(CountingSubscriber {
                seen: AtomicUsize::new(0),
                last: IrqSafeRwLock::new(0),
            })
        }
    }

    impl Subscriber for CountingSubscriber {
        fn notify(&self, _topic: &Topic, notification: &RcuArc<Box<dyn Notification>>) {
            self.seen.fetch_add(1, Ordering::Relaxed);
            *self.last.write() = notification.get().instant();
        }
    }

    /// `publish` needs a `&'static Domain` to hand to `RcuArc::new`, the
    /// same way `rcu`'s own tests mint a `&'static Domain` with
    /// `Box::leak` rather than standing up a process-wide singleton per
    /// test.
    fn fresh_stream() -> &'static NotificationStream {
        Box::leak(Box::new(NotificationStream::new()))
    }

    fn fresh_topic(stream: &'static NotificationStream, capacity: usize) -> &'static Topic {
        stream
            .create_topic(Uuid::from_u128(1), String::from("ping"), capacity)
            .unwrap()
    }

    #[test]
    fn create_topic_is_idempotent_on_uuid_collision() {
        let stream = fresh_stream();
        let first = stream
            .create_topic(Uuid::from_u128(42), String::from("a"), 4)
            .unwrap();
        let second = stream
            .create_topic(Uuid::from_u128(42), String::from("b"), 4)
            .unwrap();
        assert_eq!(first.name(), "a");
        assert_eq!(second.name(), "a");
        assert!(core::ptr::eq(first, second));
    }

    #[test]
    fn find_topic_returns_none_for_unknown_id() {
        let stream = fresh_stream();
        assert!(stream.find_topic(Uuid::from_u128(7)).is_none());
    }

    #[test]
    fn publish_and_process_delivers_in_enqueue_order() {
        let stream = fresh_stream();
        let topic = fresh_topic(stream, 8);
        let subscriber = CountingSubscriber::new();
        stream.subscribe(topic, subscriber.clone());

        stream.publish(topic, Ping(1)).unwrap();
        stream.publish(topic, Ping(2)).unwrap();
        stream.publish(topic, Ping(3)).unwrap();

        let delivered = stream.process(topic, 10);
        assert_eq!(delivered, 3);
        assert_eq!(subscriber.seen.load(Ordering::Relaxed), 3);
        assert_eq!(*subscriber.last.read(), 3);
    }

    #[test]
    fn publish_fails_once_queue_is_at_capacity() {
        let stream = fresh_stream();
        let topic = fresh_topic(stream, 2);
        stream.publish(topic, Ping(1)).unwrap();
        stream.publish(topic, Ping(2)).unwrap();
        assert!(stream.publish(topic, Ping(3)).is_err());
    }

    #[test]
    fn process_with_zero_limit_is_a_no_op() {
        let stream = fresh_stream();
        let topic = fresh_topic(stream, 4);
        stream.publish(topic, Ping(1)).unwrap();
        assert_eq!(stream.process(topic, 0), 0);
        // Still pending: a non-zero limit now drains it.
        assert_eq!(stream.process(topic, 10), 1);
    }

    #[test]
    fn process_all_caps_total_deliveries_across_topics() {
        let stream = fresh_stream();
        let a = stream
            .create_topic(Uuid::from_u128(1), String::from("a"), 8)
            .unwrap();
        let b = stream
            .create_topic(Uuid::from_u128(2), String::from("b"), 8)
            .unwrap();
        for _ in 0..3 {
            stream.publish(a, Ping(0)).unwrap();
            stream.publish(b, Ping(0)).unwrap();
        }

        // Exactly exhausts `a`'s three pending notifications, leaving `b`'s
        // budget at zero for the remainder of this call. Before the fix
        // this was the scenario that made the next iteration's
        // `limit - delivered` underflow.
        let delivered = stream.process_all(3);
        assert_eq!(delivered, 3);

        // `b`'s three notifications are still pending.
        assert_eq!(stream.process_all(10), 3);
    }

    #[test]
    fn process_advances_the_domain_epoch_so_reclamation_can_happen() {
        let stream = fresh_stream();
        let topic = fresh_topic(stream, 4);
        stream.publish(topic, Ping(1)).unwrap();
        let epoch_before = stream.domain().current_epoch();
        stream.process(topic, 10);
        assert!(stream.domain().current_epoch() > epoch_before, "a delivery should try to advance the domain, not just dequeue");
    }

    #[test]
    fn process_all_advances_the_domain_epoch_too() {
        let stream = fresh_stream();
        let topic = fresh_topic(stream, 4);
        stream.publish(topic, Ping(1)).unwrap();
        let epoch_before = stream.domain().current_epoch();
        stream.process_all(10);
        assert!(stream.domain().current_epoch() > epoch_before);
    }

    #[test]
    fn process_with_nothing_delivered_does_not_advance_the_domain() {
        let stream = fresh_stream();
        let topic = fresh_topic(stream, 4);
        let epoch_before = stream.domain().current_epoch();
        stream.process(topic, 10);
        assert_eq!(stream.domain().current_epoch(), epoch_before);
    }

    #[test]
    fn unsubscribe_stops_future_deliveries() {
        let stream = fresh_stream();
        let topic = fresh_topic(stream, 4);
        let subscriber = CountingSubscriber::new();
        let id = stream.subscribe(topic, subscriber.clone());

        stream.publish(topic, Ping(1)).unwrap();
        stream.process(topic, 10);
        assert_eq!(subscriber.seen.load(Ordering::Relaxed), 1);

        stream.unsubscribe(topic, id);
        stream.publish(topic, Ping(2)).unwrap();
        stream.process(topic, 10);
        assert_eq!(subscriber.seen.load(Ordering::Relaxed), 1);
    }
}
