//! Publish/subscribe dispatch with corking and bus-to-bus chaining.
//!
//! Subscribers registered under an exact event name and under the wildcard
//! pattern [`WILDCARD`] are called together, in the order they were
//! registered. While a bus is corked, triggers are queued and replayed in
//! FIFO order by the outermost [`EventBus::uncork`].
//!
//! Dispatch runs on the triggering thread. The subscriber list is
//! snapshotted before any subscriber runs, so a subscriber may trigger or
//! register on the same bus. Chaining buses into a cycle recurses forever.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::Result;

/// Pattern matching every event name.
pub const WILDCARD: &str = "*";

/// A callable subscriber, receiving the event name and payload.
pub type Sink<P> = Arc<dyn Fn(&str, &P) -> Result<()> + Send + Sync>;

/// What a pattern delivers to.
pub enum Subscriber<P> {
    Sink(Sink<P>),
    /// Another bus; it receives the same trigger and applies its own corking.
    Bus(Arc<EventBus<P>>),
}

impl<P> Clone for Subscriber<P> {
    fn clone(&self) -> Self {
        match self {
            Subscriber::Sink(sink) => Subscriber::Sink(Arc::clone(sink)),
            Subscriber::Bus(bus) => Subscriber::Bus(Arc::clone(bus)),
        }
    }
}

impl<P> fmt::Debug for Subscriber<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Subscriber::Sink(_) => f.write_str("Sink"),
            Subscriber::Bus(_) => f.write_str("Bus"),
        }
    }
}

/// Anything that can hold back its deliveries until told otherwise.
pub trait Corkable: Send + Sync {
    fn cork(&self);

    /// # Errors
    /// Returns the first error raised while replaying queued deliveries.
    fn uncork(&self) -> Result<()>;

    /// Drop queued deliveries without replaying them.
    fn discard(&self);
}

struct Registration<P> {
    seq: u64,
    subscriber: Subscriber<P>,
}

struct Inner<P> {
    subscribers: HashMap<String, Vec<Registration<P>>>,
    next_seq: u64,
    cork_depth: usize,
    queue: VecDeque<(String, P)>,
}

/// Event dispatcher carrying payloads of type `P`.
pub struct EventBus<P> {
    inner: Mutex<Inner<P>>,
}

impl<P> Default for EventBus<P> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner {
                subscribers: HashMap::new(),
                next_seq: 0,
                cork_depth: 0,
                queue: VecDeque::new(),
            }),
        }
    }
}

impl<P: Clone + Send + Sync + 'static> EventBus<P> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner<P>> {
        // a panicking subscriber never runs under the lock
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append `subscriber` to the list for `pattern`.
    pub fn register(&self, pattern: impl Into<String>, subscriber: Subscriber<P>) {
        let mut inner = self.lock();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner
            .subscribers
            .entry(pattern.into())
            .or_default()
            .push(Registration { seq, subscriber });
    }

    /// Register a closure sink.
    pub fn on<F>(&self, pattern: impl Into<String>, sink: F)
    where
        F: Fn(&str, &P) -> Result<()> + Send + Sync + 'static,
    {
        self.register(pattern, Subscriber::Sink(Arc::new(sink)));
    }

    /// Forward events matching `pattern` to another bus.
    pub fn chain(&self, pattern: impl Into<String>, bus: Arc<EventBus<P>>) {
        self.register(pattern, Subscriber::Bus(bus));
    }

    /// Remove every subscriber registered under exactly `pattern`.
    /// Returns how many were removed.
    pub fn unregister(&self, pattern: &str) -> usize {
        self.lock()
            .subscribers
            .remove(pattern)
            .map_or(0, |regs| regs.len())
    }

    #[must_use]
    pub fn subscriber_count(&self, pattern: &str) -> usize {
        self.lock().subscribers.get(pattern).map_or(0, Vec::len)
    }

    /// Deliver `name` to its subscribers now, or queue it while corked.
    ///
    /// # Errors
    /// The first subscriber error; later subscribers are not called.
    pub fn trigger(&self, name: &str, payload: P) -> Result<()> {
        let targets = {
            let mut inner = self.lock();
            if inner.cork_depth > 0 {
                inner.queue.push_back((name.to_string(), payload));
                return Ok(());
            }
            inner.targets(name)
        };
        deliver(&targets, name, &payload)
    }

    pub fn cork(&self) {
        self.lock().cork_depth += 1;
    }

    /// Leave one level of corking. The outermost call replays the queue in
    /// trigger order. Uncorking an uncorked bus does nothing.
    ///
    /// # Errors
    /// The first error raised while replaying; every queued event is still
    /// delivered.
    pub fn uncork(&self) -> Result<()> {
        let queued = {
            let mut inner = self.lock();
            match inner.cork_depth {
                0 => return Ok(()),
                1 => {
                    inner.cork_depth = 0;
                    std::mem::take(&mut inner.queue)
                }
                _ => {
                    inner.cork_depth -= 1;
                    return Ok(());
                }
            }
        };

        let mut first_err = None;
        for (name, payload) in queued {
            if let Err(err) = self.trigger(&name, payload) {
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Drop queued events. The cork depth is unchanged.
    pub fn discard(&self) {
        self.lock().queue.clear();
    }

    #[must_use]
    pub fn is_corked(&self) -> bool {
        self.lock().cork_depth > 0
    }

    #[must_use]
    pub fn queued(&self) -> usize {
        self.lock().queue.len()
    }
}

impl<P> Inner<P> {
    fn targets(&self, name: &str) -> Vec<Subscriber<P>> {
        let exact = self.subscribers.get(name).map(Vec::as_slice).unwrap_or_default();
        let wildcard = if name == WILDCARD {
            &[][..]
        } else {
            self.subscribers
                .get(WILDCARD)
                .map(Vec::as_slice)
                .unwrap_or_default()
        };

        let mut regs: Vec<&Registration<P>> = exact.iter().chain(wildcard).collect();
        regs.sort_by_key(|reg| reg.seq);
        regs.into_iter().map(|reg| reg.subscriber.clone()).collect()
    }
}

fn deliver<P: Clone + Send + Sync + 'static>(
    targets: &[Subscriber<P>],
    name: &str,
    payload: &P,
) -> Result<()> {
    for target in targets {
        match target {
            Subscriber::Sink(sink) => sink(name, payload)?,
            Subscriber::Bus(bus) => bus.trigger(name, payload.clone())?,
        }
    }
    Ok(())
}

impl<P: Clone + Send + Sync + 'static> Corkable for EventBus<P> {
    fn cork(&self) {
        EventBus::cork(self);
    }

    fn uncork(&self) -> Result<()> {
        EventBus::uncork(self)
    }

    fn discard(&self) {
        EventBus::discard(self);
    }
}

impl<P> fmt::Debug for EventBus<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("EventBus")
            .field("patterns", &inner.subscribers.len())
            .field("cork_depth", &inner.cork_depth)
            .field("queued", &inner.queue.len())
            .finish()
    }
}
