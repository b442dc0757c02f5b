// Copyright 2019 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

use super::*;
use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::time::{Duration, Instant};

/// Result of checking an inbound confirmable or non-confirmable message
/// against the recent-id cache.
#[derive(Debug, Clone, Eq, PartialEq)]
pub(crate) enum DedupOutcome {
    /// First sighting; the message id has now been recorded.
    New,

    /// A duplicate for which no reply has been produced yet.
    Duplicate,

    /// A duplicate whose reply was cached and should be resent verbatim.
    DuplicateWithReply(Vec<u8>),
}

/// The `recent_remote_ids` cache: one entry per `(peer, message id)` seen,
/// holding the cached reply datagram once one exists.
///
/// Entries expire EXCHANGE_LIFETIME after first sighting; the expiry queue
/// keeps the sweep O(1) amortized per operation.
pub(crate) struct DedupCache<SA> {
    entries: HashMap<(SA, MsgId), DedupEntry>,
    expiry_queue: VecDeque<((SA, MsgId), Instant)>,
    lifetime: Duration,
}

#[derive(Debug)]
struct DedupEntry {
    reply: Option<Vec<u8>>,
    expires: Instant,
}

impl<SA: Eq + Hash + Copy> DedupCache<SA> {
    pub(crate) fn new(lifetime: Duration) -> Self {
        DedupCache {
            entries: HashMap::new(),
            expiry_queue: VecDeque::new(),
            lifetime,
        }
    }

    /// Checks an inbound message id, recording it when it is new.
    pub(crate) fn check(&mut self, peer: SA, msg_id: MsgId) -> DedupOutcome {
        self.purge_expired(Instant::now());

        let key = (peer, msg_id);
        if let Some(entry) = self.entries.get(&key) {
            return match &entry.reply {
                Some(reply) => DedupOutcome::DuplicateWithReply(reply.clone()),
                None => DedupOutcome::Duplicate,
            };
        }

        let expires = Instant::now() + self.lifetime;
        self.entries.insert(key, DedupEntry { reply: None, expires });
        self.expiry_queue.push_back((key, expires));
        DedupOutcome::New
    }

    /// Attaches the reply datagram to an already-recorded message id, so
    /// that later duplicates get the identical bytes back.
    pub(crate) fn cache_reply(&mut self, peer: SA, msg_id: MsgId, reply: Vec<u8>) {
        if let Some(entry) = self.entries.get_mut(&(peer, msg_id)) {
            entry.reply = Some(reply);
        }
    }

    fn purge_expired(&mut self, now: Instant) {
        while let Some((key, expires)) = self.expiry_queue.front().copied() {
            if expires > now {
                break;
            }
            self.expiry_queue.pop_front();
            // Only drop the entry if it wasn't re-recorded since.
            if let Some(entry) = self.entries.get(&key) {
                if entry.expires <= now {
                    self.entries.remove(&key);
                }
            }
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.len()
    }
}

impl<SA: Eq + Hash + Copy + std::fmt::Debug> std::fmt::Debug for DedupCache<SA> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DedupCache")
            .field("entries", &self.entries.keys())
            .field("lifetime", &self.lifetime)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_detection_and_reply_cache() {
        let mut cache = DedupCache::new(Duration::from_secs(247));

        assert_eq!(cache.check(1u8, 100), DedupOutcome::New);
        assert_eq!(cache.check(1u8, 100), DedupOutcome::Duplicate);

        cache.cache_reply(1u8, 100, vec![0x60, 0x00, 0x00, 0x64]);
        assert_eq!(
            cache.check(1u8, 100),
            DedupOutcome::DuplicateWithReply(vec![0x60, 0x00, 0x00, 0x64])
        );

        // Distinct peers and distinct message ids don't collide.
        assert_eq!(cache.check(2u8, 100), DedupOutcome::New);
        assert_eq!(cache.check(1u8, 101), DedupOutcome::New);
    }

    #[test]
    fn entries_expire() {
        let mut cache = DedupCache::new(Duration::from_millis(0));
        assert_eq!(cache.check(1u8, 100), DedupOutcome::New);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.check(1u8, 100), DedupOutcome::New);
        assert_eq!(cache.len(), 1);
    }
}
