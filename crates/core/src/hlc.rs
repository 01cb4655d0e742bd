use std::cmp::Ordering;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::CoreError;

pub const MAX_DRIFT_MS: u64 = 300_000; // 5 minutes

/// Returns the current wall-clock time as milliseconds since Unix epoch.
pub fn physical_now() -> Result<u64, CoreError> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .map_err(|_| CoreError::InvalidData("system clock before epoch".into()))
}

/// Hybrid logical timestamp stamped on every ledger write.
///
/// Encoded as 12 bytes: `wall_ms` (big-endian u64) then `counter` (big-endian
/// u32), so byte order and logical order agree and SQLite can compare the
/// stored blobs directly.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug, Default)]
pub struct Hlc {
    wall_ms: u64,
    counter: u32,
}

impl Hlc {
    /// Sorts before every timestamp a clock can produce; the "since" of a
    /// device that never pulled.
    pub const ZERO: Hlc = Hlc {
        wall_ms: 0,
        counter: 0,
    };

    pub fn new(wall_ms: u64, counter: u32) -> Self {
        Self { wall_ms, counter }
    }

    pub fn wall_ms(&self) -> u64 {
        self.wall_ms
    }

    pub fn counter(&self) -> u32 {
        self.counter
    }

    pub fn to_bytes(&self) -> [u8; 12] {
        let mut buf = [0u8; 12];
        buf[..8].copy_from_slice(&self.wall_ms.to_be_bytes());
        buf[8..].copy_from_slice(&self.counter.to_be_bytes());
        buf
    }

    pub fn from_bytes(bytes: &[u8; 12]) -> Self {
        let mut wall = [0u8; 8];
        let mut counter = [0u8; 4];
        wall.copy_from_slice(&bytes[..8]);
        counter.copy_from_slice(&bytes[8..]);
        Self {
            wall_ms: u64::from_be_bytes(wall),
            counter: u32::from_be_bytes(counter),
        }
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, CoreError> {
        let arr: &[u8; 12] = bytes.try_into().map_err(|_| {
            CoreError::InvalidData(format!("hlc must be 12 bytes, got {}", bytes.len()))
        })?;
        Ok(Self::from_bytes(arr))
    }
}

impl Ord for Hlc {
    fn cmp(&self, other: &Self) -> Ordering {
        self.to_bytes().cmp(&other.to_bytes())
    }
}

impl PartialOrd for Hlc {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Serialize for Hlc {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.to_bytes())
    }
}

impl<'de> Deserialize<'de> for Hlc {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bytes: serde_bytes_compat::Bytes = Deserialize::deserialize(deserializer)?;
        Hlc::from_slice(&bytes.0).map_err(serde::de::Error::custom)
    }
}

mod serde_bytes_compat {
    use serde::de::{self, SeqAccess, Visitor};
    use serde::{Deserialize, Deserializer};
    use std::fmt;

    /// Accepts both a byte string and a sequence of u8, since rmp-serde
    /// emits bin while self-describing formats may hand back an array.
    pub struct Bytes(pub Vec<u8>);

    impl<'de> Deserialize<'de> for Bytes {
        fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
            struct BytesVisitor;

            impl<'de> Visitor<'de> for BytesVisitor {
                type Value = Bytes;

                fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    f.write_str("12 bytes")
                }

                fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Bytes, E> {
                    Ok(Bytes(v.to_vec()))
                }

                fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> Result<Bytes, E> {
                    Ok(Bytes(v))
                }

                fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Bytes, A::Error> {
                    let mut out = Vec::with_capacity(12);
                    while let Some(b) = seq.next_element::<u8>()? {
                        out.push(b);
                    }
                    Ok(Bytes(out))
                }
            }

            deserializer.deserialize_bytes(BytesVisitor)
        }
    }
}

/// Issues strictly increasing [`Hlc`] timestamps.
///
/// A writer sharing its store with other processes calls [`HlcClock::observe`]
/// with the greatest timestamp already stored before ticking, so its next
/// timestamp sorts after everything written so far.
#[derive(Debug, Default)]
pub struct HlcClock {
    last: Hlc,
}

impl HlcClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last(&self) -> Hlc {
        self.last
    }

    /// Generate the next timestamp, greater than every one issued or observed.
    pub fn tick(&mut self) -> Result<Hlc, CoreError> {
        let now = physical_now()?;

        let hlc = if now > self.last.wall_ms {
            Hlc::new(now, 0)
        } else {
            let counter = self.last.counter.checked_add(1).ok_or_else(|| {
                CoreError::InvalidOperation("hlc counter exhausted".into())
            })?;
            Hlc::new(self.last.wall_ms, counter)
        };

        self.last = hlc;
        Ok(hlc)
    }

    /// Raise the clock to at least `seen`. Timestamps further ahead of the
    /// local wall clock than [`MAX_DRIFT_MS`] are refused.
    pub fn observe(&mut self, seen: &Hlc) -> Result<(), CoreError> {
        let now = physical_now()?;
        if seen.wall_ms > now + MAX_DRIFT_MS {
            return Err(CoreError::ClockDrift {
                delta_ms: seen.wall_ms - now,
                max_ms: MAX_DRIFT_MS,
            });
        }
        if *seen > self.last {
            self.last = *seen;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_monotonicity() {
        let mut clock = HlcClock::new();
        let mut prev = clock.tick().unwrap();
        for _ in 0..100 {
            let next = clock.tick().unwrap();
            assert!(next > prev, "expected {next:?} > {prev:?}");
            prev = next;
        }
    }

    #[test]
    fn observed_future_timestamp_bumps_counter() {
        let mut clock = HlcClock::new();
        let ahead = Hlc::new(physical_now().unwrap() + 60_000, 7);
        clock.observe(&ahead).unwrap();

        let t1 = clock.tick().unwrap();
        assert_eq!(t1.wall_ms(), ahead.wall_ms());
        assert_eq!(t1.counter(), 8);
        assert!(clock.tick().unwrap() > t1);
    }

    #[test]
    fn observing_older_timestamp_is_a_no_op() {
        let mut clock = HlcClock::new();
        let t1 = clock.tick().unwrap();
        clock.observe(&Hlc::new(1, 0)).unwrap();
        assert_eq!(clock.last(), t1);
    }

    #[test]
    fn ordering_matches_bytes() {
        let pairs = [
            (Hlc::new(100, 0), Hlc::new(200, 0)),
            (Hlc::new(100, 0), Hlc::new(100, 1)),
            (Hlc::new(100, 999), Hlc::new(101, 0)),
            (Hlc::ZERO, Hlc::new(0, 1)),
        ];

        for (a, b) in &pairs {
            assert_eq!(a.cmp(b), a.to_bytes().cmp(&b.to_bytes()));
            assert!(a < b, "expected {a:?} < {b:?}");
        }
        let hlc = Hlc::new(1_700_000_000_000, 42);
        assert_eq!(Hlc::from_bytes(&hlc.to_bytes()), hlc);
    }

    #[test]
    fn drift_rejection() {
        let mut clock = HlcClock::new();
        let now = physical_now().unwrap();
        match clock.observe(&Hlc::new(now + MAX_DRIFT_MS + 1_000, 0)) {
            Err(CoreError::ClockDrift { delta_ms, max_ms }) => {
                assert!(delta_ms > MAX_DRIFT_MS);
                assert_eq!(max_ms, MAX_DRIFT_MS);
            }
            other => panic!("expected ClockDrift, got {other:?}"),
        }
    }

    #[test]
    fn from_slice_checks_length() {
        assert!(Hlc::from_slice(&[0u8; 11]).is_err());
        assert_eq!(Hlc::from_slice(&[0u8; 12]).unwrap(), Hlc::ZERO);
    }

    #[test]
    fn msgpack_roundtrip() {
        let hlc = Hlc::new(1_700_000_000_000, 3);
        let bytes = rmp_serde::to_vec(&hlc).unwrap();
        let back: Hlc = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(back, hlc);
    }
}
