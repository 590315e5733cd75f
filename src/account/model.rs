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

use std::collections::BTreeMap;
use std::convert::{TryFrom, TryInto};
use std::fmt;
use std::marker::PhantomData;
use std::num::NonZeroU32;
use std::ops::Bound::{Excluded, Included, Unbounded};
use std::str::FromStr;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::support::error::Error;

/// Identifies a mailbox within one user's store.
///
/// Mailbox ids double as the mailbox's UIDVALIDITY. They are allocated
/// strictly increasing and never reused, even if a mailbox with the same name
/// is deleted and recreated.
#[derive(
    Deserialize,
    Serialize,
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
)]
#[serde(transparent)]
pub struct MailboxId(pub u32);

impl fmt::Display for MailboxId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies the text of a message within one user's store.
///
/// Message ids are assigned sequentially from 1 and never reused. A message
/// is stored once no matter how many mailboxes it is placed in.
#[derive(
    Deserialize,
    Serialize,
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
)]
#[serde(transparent)]
pub struct MessageId(pub u64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Uniquely identifies a message within a single mailbox.
///
/// UIDs start at 1 and increase monotonically as messages are placed into the
/// mailbox. UIDs are never reused.
#[derive(
    Deserialize, Serialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(transparent)]
pub struct Uid(pub NonZeroU32);

impl fmt::Debug for Uid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Uid({})", self.0.get())
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0.get())
    }
}

impl Uid {
    // Unsafe because new() isn't const for some reason
    pub const MIN: Self = unsafe { Uid(NonZeroU32::new_unchecked(1)) };

    pub fn of(uid: u32) -> Option<Self> {
        NonZeroU32::new(uid).map(Uid)
    }

    pub fn next(self) -> Option<Self> {
        self.0.get().checked_add(1).and_then(Uid::of)
    }

    #[cfg(test)]
    pub fn u(uid: u32) -> Self {
        Uid::of(uid).unwrap()
    }
}

impl TryFrom<u32> for Uid {
    type Error = ();

    fn try_from(v: u32) -> Result<Self, ()> {
        Self::of(v).ok_or(())
    }
}

impl From<Uid> for u32 {
    fn from(uid: Uid) -> u32 {
        uid.0.get()
    }
}

/// The 1-based position of a message within a point-in-time snapshot of a
/// mailbox.
#[derive(
    Deserialize, Serialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(transparent)]
pub struct Seqnum(pub NonZeroU32);

impl Seqnum {
    pub fn of(seqnum: u32) -> Option<Self> {
        NonZeroU32::new(seqnum).map(Seqnum)
    }

    #[cfg(test)]
    pub fn u(seqnum: u32) -> Self {
        Seqnum::of(seqnum).unwrap()
    }

    pub fn to_index(self) -> usize {
        self.0.get() as usize - 1
    }

    pub fn from_index(ix: usize) -> Self {
        Seqnum::of((ix + 1).try_into().unwrap()).unwrap()
    }
}

impl TryFrom<u32> for Seqnum {
    type Error = ();

    fn try_from(v: u32) -> Result<Self, ()> {
        Self::of(v).ok_or(())
    }
}

impl From<Seqnum> for u32 {
    fn from(seqnum: Seqnum) -> u32 {
        seqnum.0.get()
    }
}

impl fmt::Debug for Seqnum {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Seqnum({})", self.0.get())
    }
}

impl fmt::Display for Seqnum {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0.get())
    }
}

/// A "sequence set range" of sequence numbers or UIDs.
///
/// Internally, this is maintained as a minimal sorted set of inclusive ranges.
/// It does not maintain information on the original fragmentation, ordering,
/// or duplication.
///
/// The `Display` format puts this into minimal IMAP wire format. Note that
/// IMAP does not have a way to represent an empty sequence set. `Display`
/// produces an empty string in that case, which is invalid.
#[derive(Clone, PartialEq, Eq)]
pub struct SeqRange<T> {
    parts: BTreeMap<u32, u32>,
    _t: PhantomData<T>,
}

impl<T> SeqRange<T> {
    /// Create a new, empty range.
    pub fn new() -> Self {
        SeqRange {
            parts: BTreeMap::new(),
            _t: PhantomData,
        }
    }

    /// Return whether this range is empty (invalid for IMAP wire format).
    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }
}

impl<T: TryFrom<u32> + Into<u32> + PartialOrd> SeqRange<T> {
    /// Append a single item to this range.
    ///
    /// The item must be strictly greater than all other items already
    /// inserted.
    pub fn append(&mut self, item: T) {
        let item: u32 = item.into();

        if let Some(end) = self.parts.values_mut().next_back() {
            assert!(item > *end);

            if item == *end + 1 {
                *end = item;
                return;
            }
        }

        self.parts.insert(item, item);
    }

    /// Insert the given inclusive range (which must be in the correct order)
    /// into this sequence set.
    pub fn insert(&mut self, start_incl: T, end_incl: T) {
        assert!(end_incl >= start_incl);
        self.insert_raw(start_incl.into(), end_incl.into());
    }

    fn insert_raw(&mut self, start_incl: u32, mut end_incl: u32) {
        // Swallow any later ranges this one overlaps or touches
        while let Some((following_start, following_end)) = self
            .parts
            .range((Excluded(start_incl), Unbounded))
            .next()
            .map(|(&start, &end)| (start, end))
        {
            if following_start - 1 > end_incl {
                break;
            }

            end_incl = end_incl.max(following_end);
            self.parts.remove(&following_start);
        }

        let preceding = self
            .parts
            .range((Unbounded, Included(start_incl)))
            .next_back()
            .map(|(&start, &end)| (start, end));
        if let Some((preceding_start, preceding_end)) = preceding {
            if preceding_end.saturating_add(1) >= start_incl {
                self.parts
                    .insert(preceding_start, end_incl.max(preceding_end));
                return;
            }
        }

        self.parts.insert(start_incl, end_incl);
    }

    /// Return whether the given item is present in this set.
    pub fn contains(&self, v: T) -> bool {
        let v: u32 = v.into();
        self.parts
            .range(..=v)
            .next_back()
            .filter(|&(_, &end)| end >= v)
            .is_some()
    }

    /// Return an iterator to the items in this set.
    ///
    /// Invalid items and items greater than `max` are silently excluded.
    ///
    /// Items are delivered in strictly ascending order.
    pub fn items<'a>(
        &'a self,
        max: impl Into<u32>,
    ) -> impl Iterator<Item = T> + 'a {
        let max: u32 = max.into();
        self.parts
            .iter()
            .map(|(&start, &end)| (start, end))
            .filter(move |&(start, _)| start <= max)
            .flat_map(move |(start, end)| start..=end.min(max))
            .filter_map(|v| T::try_from(v).ok())
    }

    /// Parse an IMAP message set: comma-separated numbers and `a:b` ranges.
    ///
    /// `splat` is the value of `*`: the last sequence number or the highest
    /// UID, which is 0 if the mailbox is empty. Ranges are inclusive in
    /// either endpoint order. Literal numbers must be at least 1.
    pub fn parse(raw: &str, splat: u32) -> Result<Self, Error> {
        fn do_parse(r: &str, splat: u32) -> Result<u32, Error> {
            if "*" == r {
                return Ok(splat);
            }

            if r.is_empty() || !r.bytes().all(|b| b.is_ascii_digit()) {
                return Err(Error::BadMessageSet);
            }

            match r.parse::<u32>() {
                Ok(n) if n >= 1 => Ok(n),
                _ => Err(Error::BadMessageSet),
            }
        }

        let mut this = Self::new();
        for part in raw.split(',') {
            let mut subs = part.split(':');
            match (subs.next(), subs.next(), subs.next()) {
                (Some(only), None, None) => {
                    let only = do_parse(only, splat)?;
                    this.insert_raw(only, only);
                }
                (Some(start), Some(end), None) => {
                    let start = do_parse(start, splat)?;
                    let end = do_parse(end, splat)?;
                    this.insert_raw(start.min(end), end.max(start));
                }
                _ => return Err(Error::BadMessageSet),
            }
        }

        Ok(this)
    }

    /// Return the total size of the sequence set.
    pub fn len(&self) -> usize {
        self.parts
            .iter()
            .map(|(start, end)| (end - start) as usize + 1)
            .sum()
    }

    /// Return the maximum value in this sequence set, raw.
    pub fn max(&self) -> Option<u32> {
        self.parts.values().next_back().copied()
    }
}

impl<T> fmt::Display for SeqRange<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (ix, (&start, &end)) in self.parts.iter().enumerate() {
            let delim = if 0 == ix { "" } else { "," };

            if start == end {
                write!(f, "{}{}", delim, start)?;
            } else {
                write!(f, "{}{}:{}", delim, start, end)?;
            }
        }

        Ok(())
    }
}

impl fmt::Debug for SeqRange<Seqnum> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[Seqnum {}]", self)
    }
}

impl fmt::Debug for SeqRange<Uid> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[Uid {}]", self)
    }
}

impl<T> Default for SeqRange<T> {
    fn default() -> Self {
        SeqRange::new()
    }
}

/// A system flag.
///
/// All flags except `Deleted` belong to the message and are shared by every
/// mailbox it is placed in. `Deleted` is local to one placement, since
/// marking a message for expunge in one mailbox must not affect the others.
///
/// `Recent` is maintained by the store: set when a message arrives, cleared
/// when a session closes the mailbox it was seen in.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Flag {
    Answered,
    Flagged,
    Deleted,
    Seen,
    Draft,
    Recent,
}

impl Flag {
    pub const ALL: [Flag; 6] = [
        Flag::Answered,
        Flag::Flagged,
        Flag::Deleted,
        Flag::Seen,
        Flag::Draft,
        Flag::Recent,
    ];

    /// The lower-case name, as used in storage keys.
    pub fn name(self) -> &'static str {
        match self {
            Flag::Answered => "answered",
            Flag::Flagged => "flagged",
            Flag::Deleted => "deleted",
            Flag::Seen => "seen",
            Flag::Draft => "draft",
            Flag::Recent => "recent",
        }
    }

    pub fn bit(self) -> FlagSet {
        match self {
            Flag::Answered => FlagSet::ANSWERED,
            Flag::Flagged => FlagSet::FLAGGED,
            Flag::Deleted => FlagSet::DELETED,
            Flag::Seen => FlagSet::SEEN,
            Flag::Draft => FlagSet::DRAFT,
            Flag::Recent => FlagSet::RECENT,
        }
    }

    /// Whether the flag is stored per placement rather than per message.
    pub fn is_placement_local(self) -> bool {
        Flag::Deleted == self
    }
}

impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Flag::Answered => write!(f, "\\Answered"),
            Flag::Flagged => write!(f, "\\Flagged"),
            Flag::Deleted => write!(f, "\\Deleted"),
            Flag::Seen => write!(f, "\\Seen"),
            Flag::Draft => write!(f, "\\Draft"),
            Flag::Recent => write!(f, "\\Recent"),
        }
    }
}

impl fmt::Debug for Flag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        <Flag as fmt::Display>::fmt(self, f)
    }
}

impl FromStr for Flag {
    type Err = Error;

    /// Parses either the IMAP form (`\Seen`) or the storage name (`seen`),
    /// ignoring ASCII case.
    fn from_str(s: &str) -> Result<Self, Error> {
        let bare = s.strip_prefix('\\').unwrap_or(s);
        Flag::ALL
            .iter()
            .copied()
            .find(|f| bare.eq_ignore_ascii_case(f.name()))
            .ok_or(Error::NxFlag)
    }
}

bitflags! {
    /// The set of message-scoped flags on one message.
    #[derive(Default)]
    pub struct FlagSet: u8 {
        const ANSWERED = 1 << 0;
        const FLAGGED = 1 << 1;
        const DELETED = 1 << 2;
        const SEEN = 1 << 3;
        const DRAFT = 1 << 4;
        const RECENT = 1 << 5;
    }
}

impl FlagSet {
    pub fn flags(self) -> impl Iterator<Item = Flag> {
        Flag::ALL.iter().copied().filter(move |f| self.contains(f.bit()))
    }
}

/// A change to a mailbox pushed from one session to the others watching it.
///
/// This is the payload the protocol layer sends through a
/// `NotificationChannel`; the store itself never publishes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MailboxEvent {
    /// A message was placed into the mailbox.
    Exists { uid: Uid },
    /// A flag of the message at `uid` changed.
    FlagsChanged { uid: Uid },
    /// The message at `uid` was expunged.
    Expunged { uid: Uid },
    /// The mailbox itself was deleted.
    MailboxDeleted,
}

/// The counters kept for one mailbox.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MailboxStatus {
    pub name: String,
    pub uid_validity: u32,
    pub next_uid: u32,
    pub messages: u64,
    /// Per-flag counts, indexed in the order of `Flag::ALL`.
    pub flag_counts: [u64; 6],
}

impl MailboxStatus {
    pub fn count(&self, flag: Flag) -> u64 {
        let ix = Flag::ALL.iter().position(|&f| f == flag).unwrap_or(0);
        self.flag_counts[ix]
    }
}

#[cfg(test)]
mod test {
    use proptest::prelude::*;

    use super::*;

    fn assert_sr(
        expected_content: &[u32],
        expected_string: &str,
        seqrange: SeqRange<Uid>,
    ) {
        let actual: Vec<u32> =
            seqrange.items(u32::MAX).map(|u| u.0.get()).collect();
        assert_eq!(expected_content, &actual[..]);
        assert_eq!(expected_string, &seqrange.to_string());
    }

    #[test]
    fn seqrange_parsing() {
        assert_sr(&[1], "1", SeqRange::parse("1", 10).unwrap());
        assert_sr(&[10], "10", SeqRange::parse("*", 10).unwrap());
        assert_sr(&[1, 2], "1:2", SeqRange::parse("1:2", 10).unwrap());
        assert_sr(&[1, 2], "1:2", SeqRange::parse("2:1", 10).unwrap());
        assert_sr(&[9, 10], "9:10", SeqRange::parse("9:*", 10).unwrap());
        assert_sr(&[9, 10], "9:10", SeqRange::parse("*:9", 10).unwrap());
        assert_sr(&[1, 3, 5], "1,3,5", SeqRange::parse("3,5,1", 10).unwrap());
        assert_sr(
            &[1, 2, 9, 10],
            "1:2,9:10",
            SeqRange::parse("*:9,2:1", 10).unwrap(),
        );
        for raw in &["1,2:3,4", "2:3,1:4", "2,4:1,3"] {
            assert_sr(&[1, 2, 3, 4], "1:4", SeqRange::parse(raw, 10).unwrap());
        }
    }

    #[test]
    fn seqrange_parse_errors() {
        for bad in &["", "0", "1:0", "a", "1,", ",1", "1:2:3", "-1", "+1", " 1"]
        {
            assert_matches!(
                Err(Error::BadMessageSet),
                SeqRange::<Uid>::parse(bad, 10)
            );
        }
        assert_matches!(
            Err(Error::BadMessageSet),
            SeqRange::<Uid>::parse("99999999999", 10)
        );
    }

    #[test]
    fn splat_in_empty_mailbox_selects_nothing() {
        let sr = SeqRange::<Seqnum>::parse("*", 0).unwrap();
        assert_eq!(0, sr.items(u32::MAX).count());
    }

    #[test]
    fn seqrange_append() {
        let mut seqrange = SeqRange::new();
        seqrange.append(Uid::u(1));
        seqrange.append(Uid::u(2));
        seqrange.append(Uid::u(3));
        assert_eq!("1:3", &seqrange.to_string());
        seqrange.append(Uid::u(5));
        seqrange.append(Uid::u(6));
        assert_eq!("1:3,5:6", &seqrange.to_string());
        assert_eq!(5, seqrange.len());
        assert_eq!(Some(6), seqrange.max());
    }

    #[test]
    fn flag_parsing() {
        assert_eq!(Flag::Seen, "\\Seen".parse::<Flag>().unwrap());
        assert_eq!(Flag::Seen, "seen".parse::<Flag>().unwrap());
        assert_eq!(Flag::Deleted, "\\DELETED".parse::<Flag>().unwrap());
        assert_eq!(Flag::Recent, "recent".parse::<Flag>().unwrap());
        assert_matches!(Err(Error::NxFlag), "\\Important".parse::<Flag>());
        assert_matches!(Err(Error::NxFlag), "\\\\seen".parse::<Flag>());

        for &flag in &Flag::ALL {
            assert_eq!(flag, flag.to_string().parse::<Flag>().unwrap());
        }
    }

    #[test]
    fn flag_set_iteration() {
        let set = FlagSet::SEEN | FlagSet::RECENT;
        assert_eq!(
            vec![Flag::Seen, Flag::Recent],
            set.flags().collect::<Vec<_>>()
        );
        assert!(Flag::Deleted.is_placement_local());
        assert!(!Flag::Seen.is_placement_local());
    }

    proptest! {
        #[test]
        fn seqrange_properties(
            ranges in prop::collection::vec((1u32..30, 1u32..=10), 1..=5)
        ) {
            let mut expected = Vec::new();
            let mut seqrange = SeqRange::new();

            for &(start, extent) in &ranges {
                seqrange.insert(Uid::u(start), Uid::u(start + extent));
                expected.extend(start..=start + extent);
            }

            expected.sort();
            expected.dedup();

            let actual: Vec<u32> = seqrange.items(u32::MAX).map(
                |u| u.0.get()).collect();
            prop_assert_eq!(&expected, &actual);

            for i in 1..50 {
                prop_assert_eq!(
                    expected.contains(&i),
                    seqrange.contains(Uid::u(i)),
                    "Bad contains result for {}",
                    i
                );
            }

            prop_assert_eq!(
                &seqrange,
                &SeqRange::parse(&seqrange.to_string(), u32::MAX).unwrap());
        }
    }
}
