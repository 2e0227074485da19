/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Fractional-index order keys.
//!
//! An order key is a string over the base-62 alphabet (`0-9A-Za-z`, in ASCII
//! order) with two parts: a variable-length integer whose first character
//! encodes its own length (`a0`, `b00`, ... for positives, `Zz`, `Yzz`, ...
//! for negatives) and an optional fraction that never ends in the zero
//! digit. The encoding is arranged so that comparing two keys as plain
//! strings compares the positions they denote. [`key_between`] produces a
//! key strictly between its two bounds without touching any existing key,
//! which is what lets a sibling be inserted or reordered without ever
//! renumbering its neighbors: appends and prepends consume integer keys
//! (logarithmic growth), repeated splits of one gap extend the fraction one
//! digit at a time.

use std::fmt;

/// The digit alphabet. Chosen so that byte order equals digit order.
const DIGITS: &[u8; 62] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

const BASE: usize = DIGITS.len();

/// The integer part of the very first key handed out for an empty list.
const INTEGER_ZERO: &str = "a0";

/// The most negative expressible integer part. Never valid as a key on its
/// own: there would be no room left below it.
const SMALLEST_INTEGER: &str = "A00000000000000000000000000";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("invalid order key {0:?}")]
    InvalidKey(String),
    #[error("order keys out of order: {0:?} is not before {1:?}")]
    OutOfOrder(String, String),
    #[error("no room left {0} key {1:?}")]
    Exhausted(&'static str, String),
}

pub type Result<T> = std::result::Result<T, Error>;

fn digit_index(b: u8) -> Option<usize> {
    match b {
        b'0'..=b'9' => Some((b - b'0') as usize),
        b'A'..=b'Z' => Some((b - b'A') as usize + 10),
        b'a'..=b'z' => Some((b - b'a') as usize + 36),
        _ => None,
    }
}

/// Length of an integer part, from its head character.
fn integer_len(head: u8) -> Option<usize> {
    match head {
        b'a'..=b'z' => Some((head - b'a') as usize + 2),
        b'A'..=b'Z' => Some((b'Z' - head) as usize + 2),
        _ => None,
    }
}

/// Splits a structurally valid key into (integer, fraction).
fn split_key(key: &str) -> Option<(&str, &str)> {
    let head = *key.as_bytes().first()?;
    let len = integer_len(head)?;
    if key.len() < len {
        return None;
    }
    Some(key.split_at(len))
}

/// Returns true if `key` is a well-formed order key.
pub fn is_valid_key(key: &str) -> bool {
    if key == SMALLEST_INTEGER || !key.bytes().all(|b| digit_index(b).is_some()) {
        return false;
    }
    match split_key(key) {
        Some((_, frac)) => !frac.ends_with('0'),
        None => false,
    }
}

fn check_key(key: &str) -> Result<()> {
    if is_valid_key(key) {
        Ok(())
    } else {
        Err(Error::InvalidKey(key.into()))
    }
}

/// Adds one to an integer part. `None` when the largest integer overflows.
fn increment_integer(int: &str) -> Option<String> {
    let head = int.as_bytes()[0];
    let mut digits: Vec<u8> = int.as_bytes()[1..].to_vec();
    for i in (0..digits.len()).rev() {
        let d = digit_index(digits[i]).expect("validated digit");
        if d + 1 < BASE {
            digits[i] = DIGITS[d + 1];
            return Some(assemble(head, &digits));
        }
        digits[i] = DIGITS[0];
    }
    // Carried out of every digit: move to the next integer length.
    match head {
        b'Z' => Some(INTEGER_ZERO.into()),
        b'z' => None,
        _ => {
            let head = head + 1;
            if head > b'a' {
                // Positive integers get longer as they grow.
                digits.push(DIGITS[0]);
            } else {
                // Negative integers get shorter as they approach zero.
                digits.pop();
            }
            Some(assemble(head, &digits))
        }
    }
}

/// Subtracts one from an integer part. `None` below [`SMALLEST_INTEGER`].
fn decrement_integer(int: &str) -> Option<String> {
    let head = int.as_bytes()[0];
    let mut digits: Vec<u8> = int.as_bytes()[1..].to_vec();
    for i in (0..digits.len()).rev() {
        let d = digit_index(digits[i]).expect("validated digit");
        if d > 0 {
            digits[i] = DIGITS[d - 1];
            return Some(assemble(head, &digits));
        }
        digits[i] = DIGITS[BASE - 1];
    }
    // Borrowed out of every digit: move to the previous integer length.
    match head {
        b'a' => Some("Zz".into()),
        b'A' => None,
        _ => {
            let head = head - 1;
            if head < b'Z' {
                // Negative integers get longer as they shrink.
                digits.push(DIGITS[BASE - 1]);
            } else {
                // Positive integers get shorter as they approach zero.
                digits.pop();
            }
            Some(assemble(head, &digits))
        }
    }
}

fn assemble(head: u8, digits: &[u8]) -> String {
    let mut out = Vec::with_capacity(1 + digits.len());
    out.push(head);
    out.extend_from_slice(digits);
    String::from_utf8(out).expect("alphabet is ascii")
}

/// Midpoint of the open fraction interval (`a`, `b`), where the empty string
/// is zero and `None` is one. Precondition (upheld by callers): `a < b`.
fn midpoint(a: &str, b: Option<&str>) -> String {
    if let Some(b) = b {
        debug_assert!(a < b, "midpoint bounds inverted: {:?} >= {:?}", a, b);
        // Shared leading digits contribute nothing to the interval; keep
        // them and recurse on the tails.
        let ab = a.as_bytes();
        let bb = b.as_bytes();
        let mut n = 0;
        while n < bb.len() && ab.get(n).copied().unwrap_or(b'0') == bb[n] {
            n += 1;
        }
        debug_assert!(n < bb.len(), "upper bound {:?} is a prefix of {:?}", b, a);
        if n > 0 {
            return format!("{}{}", &b[..n], midpoint(&a[n..], Some(&b[n..])));
        }
    }
    // First digits differ (or a bound ran out of digits).
    let dig_a = a.bytes().next().and_then(digit_index).unwrap_or(0);
    let dig_b = b
        .and_then(|b| b.bytes().next())
        .and_then(digit_index)
        .unwrap_or(BASE);
    if dig_b - dig_a > 1 {
        let mid = (dig_a + dig_b + 1) / 2;
        (DIGITS[mid] as char).to_string()
    } else if b.map_or(false, |b| b.len() > 1) {
        // Consecutive digits, but b's own first digit already lies strictly
        // inside the interval.
        b.unwrap()[..1].to_string()
    } else {
        // Consecutive digits and nothing usable in b; keep a's digit and
        // find a fraction above a's tail.
        let tail = if a.is_empty() { "" } else { &a[1..] };
        format!("{}{}", DIGITS[dig_a] as char, midpoint(tail, None))
    }
}

/// Returns a key strictly between `left` and `right`.
///
/// `None` on the left means "before everything", on the right "after
/// everything"; `key_between(None, None)` yields the first key for an empty
/// sibling list. Both bounds are left untouched, so inserting between two
/// adjacent siblings never cascades into renumbering.
pub fn key_between(left: Option<&str>, right: Option<&str>) -> Result<String> {
    if let Some(l) = left {
        check_key(l)?;
    }
    if let Some(r) = right {
        check_key(r)?;
    }
    match (left, right) {
        (None, None) => Ok(INTEGER_ZERO.into()),
        (None, Some(b)) => {
            let (ib, fb) = split_key(b).expect("validated");
            if ib == SMALLEST_INTEGER {
                return Ok(format!("{}{}", ib, midpoint("", Some(fb))));
            }
            if ib < b {
                // b carries a fraction, so its bare integer sits below it.
                return Ok(ib.into());
            }
            decrement_integer(ib).ok_or_else(|| Error::Exhausted("below", b.into()))
        }
        (Some(a), None) => {
            let (ia, fa) = split_key(a).expect("validated");
            match increment_integer(ia) {
                Some(i) => Ok(i),
                None => Ok(format!("{}{}", ia, midpoint(fa, None))),
            }
        }
        (Some(a), Some(b)) => {
            if a >= b {
                return Err(Error::OutOfOrder(a.into(), b.into()));
            }
            let (ia, fa) = split_key(a).expect("validated");
            let (ib, fb) = split_key(b).expect("validated");
            if ia == ib {
                return Ok(format!("{}{}", ia, midpoint(fa, Some(fb))));
            }
            match increment_integer(ia) {
                Some(i) if i.as_str() < b => Ok(i),
                _ => Ok(format!("{}{}", ia, midpoint(fa, None))),
            }
        }
    }
}

/// A validated order key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OrderKey(String);

impl OrderKey {
    pub fn new(key: impl Into<String>) -> Result<Self> {
        let key = key.into();
        check_key(&key)?;
        Ok(OrderKey(key))
    }

    pub fn between(left: Option<&OrderKey>, right: Option<&OrderKey>) -> Result<Self> {
        Ok(OrderKey(key_between(
            left.map(|k| k.0.as_str()),
            right.map(|k| k.0.as_str()),
        )?))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for OrderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for OrderKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn between(l: Option<&str>, r: Option<&str>) -> String {
        let k = key_between(l, r).expect("valid bounds");
        assert!(is_valid_key(&k), "produced invalid key {:?}", k);
        if let Some(l) = l {
            assert!(l < k.as_str(), "{:?} not above {:?}", k, l);
        }
        if let Some(r) = r {
            assert!(k.as_str() < r, "{:?} not below {:?}", k, r);
        }
        k
    }

    #[test]
    fn first_key() {
        assert_eq!(between(None, None), "a0");
    }

    #[test]
    fn appends_use_integer_keys() {
        assert_eq!(between(Some("a0"), None), "a1");
        assert_eq!(between(Some("a1"), None), "a2");
        assert_eq!(between(Some("az"), None), "b00");
        assert_eq!(between(Some("b0z"), None), "b10");
        assert_eq!(between(Some("zzzzzzzzzzzzzzzzzzzzzzzzzzz"), None).len(), 28);
    }

    #[test]
    fn prepends_use_negative_integer_keys() {
        assert_eq!(between(None, Some("a0")), "Zz");
        assert_eq!(between(None, Some("Zz")), "Zy");
        assert_eq!(between(None, Some("Z0")), "Yzz");
        // Below a key with a fraction, the bare integer is enough.
        assert_eq!(between(None, Some("a0V")), "a0");
    }

    #[test]
    fn splits_extend_the_fraction() {
        assert_eq!(between(Some("a0"), Some("a1")), "a0V");
        assert_eq!(between(Some("a0"), Some("a0V")), "a0G");
        assert_eq!(between(Some("a0V"), Some("a1")), "a0l");
        assert_eq!(between(Some("a0"), Some("a02")), "a01");
        // Adjacent integers with no usable gap fall back to a fraction.
        assert_eq!(between(Some("a1"), Some("a2")), "a1V");
        // Distant integers use the increment directly.
        assert_eq!(between(Some("a1"), Some("b00")), "a2");
    }

    #[test]
    fn validation() {
        for bad in [
            "",
            "0",          // digit head
            "a",          // truncated integer
            "a0!",        // bad character
            "a00",        // fraction with trailing zero
            SMALLEST_INTEGER,
        ] {
            assert!(
                matches!(key_between(Some(bad), None), Err(Error::InvalidKey(_))),
                "{:?} should be rejected",
                bad
            );
        }
        assert!(matches!(
            key_between(Some("a1"), Some("a0")),
            Err(Error::OutOfOrder(_, _))
        ));
        assert!(matches!(
            key_between(Some("a0"), Some("a0")),
            Err(Error::OutOfOrder(_, _))
        ));
    }

    #[test]
    fn append_growth_is_logarithmic() {
        let mut last = between(None, None);
        for _ in 0..1000 {
            last = between(Some(&last), None);
        }
        assert!(last.len() <= 4, "append key grew to {:?}", last);
    }

    #[test]
    fn prepend_growth_is_logarithmic() {
        let mut first = between(None, None);
        for _ in 0..1000 {
            first = between(None, Some(&first));
        }
        assert!(first.len() <= 4, "prepend key grew to {:?}", first);
    }

    #[test]
    fn dense_insertion_stays_ordered() {
        // Keep splitting gaps all over the list; every new key must slot in
        // strictly between its neighbors.
        let mut keys = vec![between(None, None)];
        for i in 0..500 {
            let at = i % keys.len();
            let left = keys.get(at).cloned();
            let right = keys.get(at + 1).cloned();
            let k = between(left.as_deref(), right.as_deref());
            keys.insert(at + 1, k);
        }
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
        sorted.dedup();
        assert_eq!(sorted.len(), keys.len(), "duplicate keys generated");
    }

    #[test]
    fn order_key_wrapper() {
        let a = OrderKey::new("a0").unwrap();
        let c = OrderKey::new("a1").unwrap();
        let b = OrderKey::between(Some(&a), Some(&c)).unwrap();
        assert!(a < b && b < c);
        assert_eq!(b.as_str(), "a0V");
        assert!(OrderKey::new("bad key").is_err());
    }
}
