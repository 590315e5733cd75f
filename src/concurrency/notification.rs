//-
// Copyright (c) 2020, Jason Lingle
//
// This file is part of Kvmail.
//
// Kvmail is free software: you can  redistribute it and/or modify it under the
// terms of  the GNU General Public  License as published by  the Free Software
// Foundation, either version  3 of the License, or (at  your option) any later
// version.
//
// Kvmail is distributed  in the hope that  it will be useful,  but WITHOUT ANY
// WARRANTY; without  even the implied  warranty of MERCHANTABILITY  or FITNESS
// FOR  A PARTICULAR  PURPOSE.  See the  GNU General  Public  License for  more
// details.
//
// You should have received a copy of the GNU General Public License along with
// Kvmail. If not, see <http://www.gnu.org/licenses/>.

//! In-process change notification between sessions watching a mailbox.
//!
//! Each session subscribes to the mailbox it has selected and gets back a
//! `Publisher` and a `Subscriber` which share one identity key. Whatever it
//! publishes reaches every other subscriber of that mailbox but never its own
//! `Subscriber`, since the session already knows what it just did.
//!
//! Subscriber queues are unbounded. A mailbox has an entry in the channel
//! only while at least one subscriber is attached to it; dropping a
//! `Subscriber` detaches it.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use crossbeam::channel::{self, Receiver, Sender};
use log::debug;

use crate::account::model::MailboxId;
use crate::support::error::Error;

#[derive(Clone, Debug)]
enum Event<M> {
    Message(M),
    Interrupt,
}

struct Registry<M> {
    next_key: u64,
    mailboxes: HashMap<MailboxId, HashMap<u64, Sender<Event<M>>>>,
}

pub struct NotificationChannel<M> {
    registry: Arc<Mutex<Registry<M>>>,
}

impl<M> Clone for NotificationChannel<M> {
    fn clone(&self) -> Self {
        NotificationChannel {
            registry: Arc::clone(&self.registry),
        }
    }
}

impl<M> Default for NotificationChannel<M> {
    fn default() -> Self {
        NotificationChannel {
            registry: Arc::new(Mutex::new(Registry {
                next_key: 0,
                mailboxes: HashMap::new(),
            })),
        }
    }
}

/// The sending half of a subscription.
pub struct Publisher<M> {
    channel: NotificationChannel<M>,
    mailbox: MailboxId,
    key: u64,
    attached: bool,
}

/// The receiving half of a subscription.
///
/// All methods take `&mut self`; the subscriber belongs to one session's
/// thread. Use `interrupter()` to stop an `idle_wait()` from elsewhere.
pub struct Subscriber<M> {
    registry: Arc<Mutex<Registry<M>>>,
    mailbox: MailboxId,
    key: u64,
    rx: Receiver<Event<M>>,
    tx: Sender<Event<M>>,
    buffer: VecDeque<M>,
    pending_interrupt: bool,
}

/// A handle which ends a `Subscriber`'s `idle_wait()` from another thread.
pub struct IdleInterrupter<M> {
    tx: Sender<Event<M>>,
}

impl<M> Clone for IdleInterrupter<M> {
    fn clone(&self) -> Self {
        IdleInterrupter {
            tx: self.tx.clone(),
        }
    }
}

impl<M: Clone + Send> NotificationChannel<M> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to changes to `mailbox`.
    pub fn subscribe(
        &self,
        mailbox: MailboxId,
    ) -> (Publisher<M>, Subscriber<M>) {
        let (tx, rx) = channel::unbounded();

        let key = {
            let mut registry = self.registry.lock().unwrap();
            let key = registry.next_key;
            registry.next_key += 1;
            registry
                .mailboxes
                .entry(mailbox)
                .or_default()
                .insert(key, tx.clone());
            key
        };

        (
            Publisher {
                channel: self.clone(),
                mailbox,
                key,
                attached: true,
            },
            Subscriber {
                registry: Arc::clone(&self.registry),
                mailbox,
                key,
                rx,
                tx,
                buffer: VecDeque::new(),
                pending_interrupt: false,
            },
        )
    }

    /// Deliver `message` to every subscriber of `mailbox` except the one
    /// whose key is `sender_key`.
    pub fn publish(&self, mailbox: MailboxId, sender_key: u64, message: M) {
        let mut registry = self.registry.lock().unwrap();
        let subscribers = match registry.mailboxes.get_mut(&mailbox) {
            Some(subscribers) => subscribers,
            None => return,
        };

        subscribers.retain(|&key, tx| {
            if key == sender_key {
                return true;
            }

            // A send only fails if the receiving queue is gone, in which case
            // there is nobody left to tell.
            let alive = tx.send(Event::Message(message.clone())).is_ok();
            if !alive {
                debug!("Dropping dead subscriber {} of {}", key, mailbox);
            }
            alive
        });

        if subscribers.is_empty() {
            registry.mailboxes.remove(&mailbox);
        }
    }

    /// Remove a subscription.
    ///
    /// `publisher` and `subscriber` must be the pair returned by one call to
    /// `subscribe()`, and must not already have been detached.
    pub fn detach(
        &self,
        publisher: &mut Publisher<M>,
        subscriber: &Subscriber<M>,
    ) -> Result<(), Error> {
        if !publisher.attached
            || publisher.key != subscriber.key
            || publisher.mailbox != subscriber.mailbox
        {
            return Err(Error::SubscriptionMismatch);
        }

        let mut registry = self.registry.lock().unwrap();
        let subscribers = registry
            .mailboxes
            .get_mut(&subscriber.mailbox)
            .ok_or(Error::SubscriptionMismatch)?;
        subscribers
            .remove(&subscriber.key)
            .ok_or(Error::SubscriptionMismatch)?;
        if subscribers.is_empty() {
            registry.mailboxes.remove(&subscriber.mailbox);
        }

        publisher.attached = false;
        Ok(())
    }

    /// The number of mailboxes with at least one subscriber.
    pub fn watched_mailboxes(&self) -> usize {
        self.registry.lock().unwrap().mailboxes.len()
    }
}

impl<M: Clone + Send> Publisher<M> {
    pub fn key(&self) -> u64 {
        self.key
    }

    pub fn mailbox_id(&self) -> MailboxId {
        self.mailbox
    }

    /// Tell every other subscriber of the mailbox about `message`.
    pub fn publish(&self, message: M) -> Result<(), Error> {
        if !self.attached {
            return Err(Error::PublisherDetached);
        }

        self.channel.publish(self.mailbox, self.key, message);
        Ok(())
    }
}

impl<M> Subscriber<M> {
    pub fn key(&self) -> u64 {
        self.key
    }

    pub fn mailbox_id(&self) -> MailboxId {
        self.mailbox
    }

    fn pull(&mut self) {
        while let Ok(event) = self.rx.try_recv() {
            self.accept(event);
        }
    }

    fn accept(&mut self, event: Event<M>) {
        match event {
            Event::Message(message) => self.buffer.push_back(message),
            Event::Interrupt => self.pending_interrupt = true,
        }
    }

    /// Return whether a message is waiting, without blocking.
    pub fn has_message(&mut self) -> bool {
        self.pull();
        !self.buffer.is_empty()
    }

    /// Take every message currently waiting, without blocking.
    pub fn fetch(&mut self) -> Vec<M> {
        self.pull();
        self.buffer.drain(..).collect()
    }

    /// Block until interrupted, passing messages to `each_batch` as they
    /// arrive.
    ///
    /// Each batch is one message that was waited for plus whatever else was
    /// already queued behind it. An interrupt ends the wait after the batch
    /// it arrived with has been delivered.
    pub fn idle_wait(&mut self, mut each_batch: impl FnMut(Vec<M>)) {
        loop {
            if self.buffer.is_empty() && !self.pending_interrupt {
                match self.rx.recv() {
                    Ok(event) => self.accept(event),
                    // Unreachable since `self.tx` is alive
                    Err(_) => return,
                }
            }

            self.pull();
            if !self.buffer.is_empty() {
                each_batch(self.buffer.drain(..).collect());
            }

            if self.pending_interrupt {
                self.pending_interrupt = false;
                return;
            }
        }
    }

    /// Make the current or next `idle_wait()` return.
    pub fn idle_interrupt(&self) {
        // Cannot fail since `self.rx` is alive
        let _ = self.tx.send(Event::Interrupt);
    }

    pub fn interrupter(&self) -> IdleInterrupter<M> {
        IdleInterrupter {
            tx: self.tx.clone(),
        }
    }
}

impl<M> Drop for Subscriber<M> {
    fn drop(&mut self) {
        // Never panic in drop, even if another thread poisoned the lock
        let mut registry = match self.registry.lock() {
            Ok(registry) => registry,
            Err(poisoned) => poisoned.into_inner(),
        };

        // Nothing to do if already detached
        let empty = match registry.mailboxes.get_mut(&self.mailbox) {
            Some(subscribers) => {
                subscribers.remove(&self.key);
                subscribers.is_empty()
            }
            None => false,
        };
        if empty {
            registry.mailboxes.remove(&self.mailbox);
        }
    }
}

impl<M> IdleInterrupter<M> {
    pub fn interrupt(&self) {
        // Fails only if the subscriber is gone, in which case it is not
        // idling.
        let _ = self.tx.send(Event::Interrupt);
    }
}

#[cfg(test)]
mod test {
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::account::model::{MailboxEvent, Uid};

    const INBOX: MailboxId = MailboxId(2);

    #[test]
    fn publisher_never_sees_itself() {
        let channel = NotificationChannel::<&'static str>::new();
        let (pub_a, mut sub_a) = channel.subscribe(INBOX);
        let (_pub_b, mut sub_b) = channel.subscribe(INBOX);
        let (_pub_c, mut sub_c) = channel.subscribe(INBOX);
        let (_pub_other, mut sub_other) = channel.subscribe(MailboxId(3));

        pub_a.publish("hello").unwrap();

        assert!(!sub_a.has_message());
        assert!(sub_a.fetch().is_empty());
        assert!(sub_b.has_message());
        assert_eq!(vec!["hello"], sub_b.fetch());
        assert_eq!(vec!["hello"], sub_c.fetch());
        assert!(sub_other.fetch().is_empty());

        // Drained
        assert!(!sub_b.has_message());
    }

    #[test]
    fn idle_wait_batches() {
        let channel = NotificationChannel::new();
        let (pub_a, _sub_a) = channel.subscribe(INBOX);
        let (_pub_b, mut sub_b) = channel.subscribe(INBOX);

        let mut batches = Vec::new();
        pub_a.publish("msg1").unwrap();
        sub_b.idle_interrupt();
        sub_b.idle_wait(|batch| batches.push(batch));
        assert_eq!(vec![vec!["msg1"]], batches);

        batches.clear();
        pub_a.publish("msg2").unwrap();
        pub_a.publish("msg3").unwrap();
        sub_b.idle_interrupt();
        sub_b.idle_wait(|batch| batches.push(batch));
        assert_eq!(vec![vec!["msg2", "msg3"]], batches);
    }

    #[test]
    fn idle_wait_interrupted_from_other_thread() {
        let channel = NotificationChannel::new();
        let (pub_a, _sub_a) = channel.subscribe(INBOX);
        let (_pub_b, mut sub_b) = channel.subscribe(INBOX);
        let interrupter = sub_b.interrupter();

        let idler = thread::spawn(move || {
            let mut received = Vec::new();
            sub_b.idle_wait(|batch| received.extend(batch));
            received
        });

        let uid = Uid::of(7).unwrap();
        pub_a.publish(MailboxEvent::Exists { uid }).unwrap();
        thread::sleep(Duration::from_millis(10));
        pub_a.publish(MailboxEvent::FlagsChanged { uid }).unwrap();
        interrupter.interrupt();

        assert_eq!(
            vec![
                MailboxEvent::Exists { uid },
                MailboxEvent::FlagsChanged { uid }
            ],
            idler.join().unwrap()
        );
    }

    #[test]
    fn detach() {
        let channel = NotificationChannel::<u32>::new();
        let (mut pub_a, sub_a) = channel.subscribe(INBOX);
        let (mut pub_b, mut sub_b) = channel.subscribe(INBOX);

        assert_matches!(
            Err(Error::SubscriptionMismatch),
            channel.detach(&mut pub_a, &sub_b)
        );

        channel.detach(&mut pub_a, &sub_a).unwrap();
        assert_matches!(Err(Error::PublisherDetached), pub_a.publish(1));
        assert_matches!(
            Err(Error::SubscriptionMismatch),
            channel.detach(&mut pub_a, &sub_a)
        );
        assert_eq!(1, channel.watched_mailboxes());

        // B has no peers left and never hears itself
        pub_b.publish(2).unwrap();
        assert!(sub_b.fetch().is_empty());

        channel.detach(&mut pub_b, &sub_b).unwrap();
        assert_eq!(0, channel.watched_mailboxes());
    }

    #[test]
    fn dropped_subscriber_is_pruned() {
        let channel = NotificationChannel::<u32>::new();
        let (pub_a, sub_a) = channel.subscribe(INBOX);
        let (pub_b, sub_b) = channel.subscribe(INBOX);
        drop(sub_b);
        drop(pub_b);

        pub_a.publish(1).unwrap();
        assert_eq!(
            1,
            channel.registry.lock().unwrap().mailboxes[&INBOX].len()
        );
        assert_eq!(1, channel.watched_mailboxes());

        drop(sub_a);
        drop(pub_a);
        assert_eq!(0, channel.watched_mailboxes());
    }

    #[test]
    fn drop_after_detach_is_harmless() {
        let channel = NotificationChannel::<u32>::new();
        let (mut pub_a, sub_a) = channel.subscribe(INBOX);
        let (_pub_b, _sub_b) = channel.subscribe(INBOX);

        channel.detach(&mut pub_a, &sub_a).unwrap();
        drop(sub_a);
        assert_eq!(
            1,
            channel.registry.lock().unwrap().mailboxes[&INBOX].len()
        );
    }

    #[test]
    fn publish_forgets_mailbox_with_only_dead_queues() {
        let channel = NotificationChannel::<u32>::new();
        let (pub_a, sub_a) = channel.subscribe(INBOX);
        drop(sub_a);
        assert_eq!(0, channel.watched_mailboxes());

        // A queue whose receiver vanished without unregistering
        let (dead_tx, dead_rx) = channel::unbounded();
        drop(dead_rx);
        channel
            .registry
            .lock()
            .unwrap()
            .mailboxes
            .entry(INBOX)
            .or_default()
            .insert(1000, dead_tx);
        assert_eq!(1, channel.watched_mailboxes());

        pub_a.publish(1).unwrap();
        assert_eq!(0, channel.watched_mailboxes());
    }
}
