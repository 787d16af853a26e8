use rand_core::RngCore;
use std::fmt;

use rand::Rng;

use crate::error::ModelError;

/// Outcome classification for one absorption attempt.
///
/// `Reject` means nothing matched and the caller must try another
/// candidate (or give up). `Accept` means the component is structurally
/// satisfied without consuming bytes. `Absorbed` means bytes were
/// consumed but input remains. `FullyAbsorbed` is only reported by the
/// top-level entry point when the whole blob was consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbsorbStatus {
    Reject,
    Accept,
    Absorbed,
    FullyAbsorbed,
}

/// Constraint toggles honored while parsing bytes back into a model.
///
/// Turning a toggle off relaxes the corresponding class of checks:
/// `contents` gates candidate-set matching, `size` gates length
/// synchronization, `structure` gates quantity intervals. `forced_size`
/// is filled in by a parent during absorption when a size sync pins how
/// many bytes this component may consume; it is only honored while
/// `size` is on.
#[derive(Debug, Clone, Copy)]
pub struct AbsorbConstraints {
    pub contents: bool,
    pub size: bool,
    pub structure: bool,
    pub forced_size: Option<u64>,
}

impl AbsorbConstraints {
    /// All checks on. This is what round-trip parsing uses.
    pub fn full() -> Self {
        Self {
            contents: true,
            size: true,
            structure: true,
            forced_size: None,
        }
    }

    /// All checks off, for scraping loosely conforming data.
    pub fn none() -> Self {
        Self {
            contents: false,
            size: false,
            structure: false,
            forced_size: None,
        }
    }

    pub(crate) fn with_forced_size(mut self, size: Option<u64>) -> Self {
        self.forced_size = size;
        self
    }
}

impl Default for AbsorbConstraints {
    fn default() -> Self {
        Self::full()
    }
}

/// Result of one absorption attempt: a status plus where the match
/// started inside the candidate blob (`offset`, non-zero when the
/// matcher skipped a gap) and how many bytes it consumed from there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AbsorbOutcome {
    pub status: AbsorbStatus,
    pub offset: usize,
    pub size: usize,
}

impl AbsorbOutcome {
    pub fn rejected() -> Self {
        Self {
            status: AbsorbStatus::Reject,
            offset: 0,
            size: 0,
        }
    }

    pub(crate) fn matched(offset: usize, size: usize) -> Self {
        let status = if size == 0 {
            AbsorbStatus::Accept
        } else {
            AbsorbStatus::Absorbed
        };
        Self {
            status,
            offset,
            size,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status != AbsorbStatus::Reject
    }

    /// Total bytes covered by this outcome, gap included.
    pub fn end(&self) -> usize {
        self.offset + self.size
    }
}

/// Contract for terminal value types: anything that can draw, hold and
/// re-parse a concrete byte value for a leaf node.
///
/// A codec owns the full value lifecycle of its node:
/// - `produce` draws the next value (random draw, or the next entry of
///   a deterministic cycle) and remembers it as the current value.
/// - `absorb` tries to recognize one of its admissible values at the
///   head of a blob and makes the match the current value.
/// - `rewind`/`reset`/`is_exhausted` expose the walk state so callers
///   can enumerate a finite codec exactly once per cycle.
///
/// The capability probes (`as_int`, `set_int`, `subfield`) replace
/// dynamic attribute lookups: callers ask, codecs answer `None`/`false`
/// when the capability is absent.
pub trait ValueCodec: fmt::Debug + Send {
    /// Short type tag used by selection criteria, e.g. `"bytes"`.
    fn kind(&self) -> &'static str;

    /// Draws the next value and returns its byte form.
    ///
    /// # Arguments
    /// * `rng`: Randomness source used in random mode. Deterministic
    ///   mode ignores it and steps an internal cursor instead.
    fn produce(&mut self, rng: &mut dyn RngCore) -> Vec<u8>;

    /// The value most recently produced, set or absorbed, if any.
    fn current(&self) -> Option<&[u8]>;

    /// Forces a specific byte value, bypassing the draw cycle.
    fn set_value(&mut self, value: &[u8]) -> Result<(), ModelError>;

    /// Tries to match one admissible value against `blob`.
    ///
    /// # Returns
    /// An [`AbsorbOutcome`]. A non-zero `offset` means the match was
    /// found past a gap of unclaimed bytes; the caller decides whether
    /// a gap is tolerable at this position.
    fn absorb(&mut self, blob: &[u8], csts: &AbsorbConstraints) -> AbsorbOutcome;

    /// Switches to deterministic enumeration of admissible values.
    fn make_determinist(&mut self);

    /// Switches back to random draws.
    fn make_random(&mut self);

    /// Steps the walk cursor back one value, so the next `produce`
    /// revisits what was just produced.
    fn rewind(&mut self);

    /// True once a deterministic cycle has wrapped around.
    fn is_exhausted(&self) -> bool;

    /// Clears the current value and walk state.
    fn reset(&mut self);

    fn box_clone(&self) -> Box<dyn ValueCodec>;

    /// Integer reading of the current value, when the codec has one.
    fn as_int(&self) -> Option<i64> {
        None
    }

    /// Writes an integer value back, when the codec supports it.
    /// Returns false when the capability is absent.
    fn set_int(&mut self, _value: i64) -> bool {
        false
    }

    /// Value of the i-th sub-field for bit-striped codecs.
    fn subfield(&self, _idx: usize) -> Option<u64> {
        None
    }
}

impl Clone for Box<dyn ValueCodec> {
    fn clone(&self) -> Self {
        self.box_clone()
    }
}

/// Byte-string codec over a finite candidate set.
///
/// In deterministic mode candidates are produced in declaration order;
/// in random mode one is drawn uniformly. During absorption candidates
/// are searched for anywhere in the blob, so a match can sit past a gap
/// (the parent then decides whether a postponed sibling claims it).
#[derive(Debug, Clone)]
pub struct BytesValue {
    candidates: Vec<Vec<u8>>,
    max_size: Option<usize>,
    determinist: bool,
    cursor: usize,
    exhausted: bool,
    current: Option<Vec<u8>>,
}

impl BytesValue {
    pub fn new<I, B>(candidates: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<Vec<u8>>,
    {
        let candidates: Vec<Vec<u8>> = candidates.into_iter().map(Into::into).collect();
        assert!(
            !candidates.is_empty(),
            "BytesValue needs at least one candidate value"
        );
        Self {
            candidates,
            max_size: None,
            determinist: true,
            cursor: 0,
            exhausted: false,
            current: None,
        }
    }

    /// Caps how many bytes an unconstrained absorption may consume.
    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = Some(max_size);
        self
    }

    fn find_in(haystack: &[u8], needle: &[u8]) -> Option<usize> {
        if needle.is_empty() {
            return Some(0);
        }
        if needle.len() > haystack.len() {
            return None;
        }
        haystack
            .windows(needle.len())
            .position(|window| window == needle)
    }
}

impl ValueCodec for BytesValue {
    fn kind(&self) -> &'static str {
        "bytes"
    }

    fn produce(&mut self, rng: &mut dyn RngCore) -> Vec<u8> {
        let value = if self.determinist {
            let value = self.candidates[self.cursor].clone();
            self.cursor += 1;
            if self.cursor == self.candidates.len() {
                self.cursor = 0;
                self.exhausted = true;
            }
            value
        } else {
            let idx = rng.random_range(0..self.candidates.len());
            self.candidates[idx].clone()
        };
        self.current = Some(value.clone());
        value
    }

    fn current(&self) -> Option<&[u8]> {
        self.current.as_deref()
    }

    fn set_value(&mut self, value: &[u8]) -> Result<(), ModelError> {
        if let Some(max) = self.max_size {
            if value.len() > max {
                return Err(ModelError::ValueRejected {
                    reason: format!("{} bytes exceeds max size {}", value.len(), max),
                });
            }
        }
        self.current = Some(value.to_vec());
        Ok(())
    }

    fn absorb(&mut self, blob: &[u8], csts: &AbsorbConstraints) -> AbsorbOutcome {
        let forced = if csts.size { csts.forced_size } else { None };

        if let Some(forced) = forced {
            let wanted = forced as usize;
            if blob.len() < wanted {
                return AbsorbOutcome::rejected();
            }
            let value = &blob[..wanted];
            if csts.contents && !self.candidates.iter().any(|c| c == value) {
                return AbsorbOutcome::rejected();
            }
            self.current = Some(value.to_vec());
            return AbsorbOutcome::matched(0, wanted);
        }

        if csts.contents {
            // Earliest match wins; on a tie the longest candidate does.
            let mut best: Option<(usize, usize)> = None;
            for candidate in &self.candidates {
                if let Some(offset) = Self::find_in(blob, candidate) {
                    let better = match best {
                        None => true,
                        Some((b_off, b_len)) => {
                            offset < b_off || (offset == b_off && candidate.len() > b_len)
                        }
                    };
                    if better {
                        best = Some((offset, candidate.len()));
                    }
                }
            }
            return match best {
                Some((offset, len)) => {
                    self.current = Some(blob[offset..offset + len].to_vec());
                    AbsorbOutcome::matched(offset, len)
                }
                None => AbsorbOutcome::rejected(),
            };
        }

        let take = self.max_size.unwrap_or(blob.len()).min(blob.len());
        self.current = Some(blob[..take].to_vec());
        AbsorbOutcome::matched(0, take)
    }

    fn make_determinist(&mut self) {
        self.determinist = true;
    }

    fn make_random(&mut self) {
        self.determinist = false;
    }

    fn rewind(&mut self) {
        if self.cursor == 0 {
            self.cursor = self.candidates.len() - 1;
        } else {
            self.cursor -= 1;
        }
    }

    fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    fn reset(&mut self) {
        self.cursor = 0;
        self.exhausted = false;
        self.current = None;
    }

    fn box_clone(&self) -> Box<dyn ValueCodec> {
        Box::new(self.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endianness {
    Big,
    Little,
}

/// Fixed-width unsigned integer codec (1, 2, 4 or 8 bytes).
///
/// Values come either from an explicit candidate list or from an
/// inclusive interval. Deterministic mode enumerates candidates in
/// order (or walks the interval upward from its minimum); random mode
/// draws uniformly. Absorption reads exactly `width` bytes at the head
/// of the blob, integers never match past a gap.
#[derive(Debug, Clone)]
pub struct UIntValue {
    width: usize,
    endian: Endianness,
    candidates: Option<Vec<u64>>,
    mini: u64,
    maxi: u64,
    determinist: bool,
    cursor: u64,
    exhausted: bool,
    current: Option<u64>,
    encoded: Option<Vec<u8>>,
}

impl UIntValue {
    pub fn new(width: usize, endian: Endianness, values: Vec<u64>) -> Self {
        assert!(
            matches!(width, 1 | 2 | 4 | 8),
            "unsupported integer width {width}"
        );
        assert!(!values.is_empty(), "UIntValue needs at least one candidate");
        for v in &values {
            assert!(
                Self::fits(width, *v),
                "candidate {v} does not fit in {width} byte(s)"
            );
        }
        Self {
            width,
            endian,
            candidates: Some(values),
            mini: 0,
            maxi: Self::max_for(width),
            determinist: true,
            cursor: 0,
            exhausted: false,
            current: None,
            encoded: None,
        }
    }

    pub fn ranged(width: usize, endian: Endianness, mini: u64, maxi: u64) -> Self {
        assert!(
            matches!(width, 1 | 2 | 4 | 8),
            "unsupported integer width {width}"
        );
        assert!(mini <= maxi, "empty interval {mini}..={maxi}");
        assert!(
            Self::fits(width, maxi),
            "interval maximum {maxi} does not fit in {width} byte(s)"
        );
        Self {
            width,
            endian,
            candidates: None,
            mini,
            maxi,
            determinist: true,
            cursor: 0,
            exhausted: false,
            current: None,
            encoded: None,
        }
    }

    pub fn fixed(width: usize, endian: Endianness, value: u64) -> Self {
        Self::new(width, endian, vec![value])
    }

    pub fn width(&self) -> usize {
        self.width
    }

    fn max_for(width: usize) -> u64 {
        if width == 8 {
            u64::MAX
        } else {
            (1u64 << (width * 8)) - 1
        }
    }

    fn fits(width: usize, value: u64) -> bool {
        value <= Self::max_for(width)
    }

    fn encode(&self, value: u64) -> Vec<u8> {
        let bytes = match self.endian {
            Endianness::Big => value.to_be_bytes(),
            Endianness::Little => value.to_le_bytes(),
        };
        match self.endian {
            Endianness::Big => bytes[8 - self.width..].to_vec(),
            Endianness::Little => bytes[..self.width].to_vec(),
        }
    }

    fn decode(&self, bytes: &[u8]) -> u64 {
        let mut buf = [0u8; 8];
        match self.endian {
            Endianness::Big => buf[8 - self.width..].copy_from_slice(bytes),
            Endianness::Little => buf[..self.width].copy_from_slice(bytes),
        }
        match self.endian {
            Endianness::Big => u64::from_be_bytes(buf),
            Endianness::Little => u64::from_le_bytes(buf),
        }
    }

    fn remember(&mut self, value: u64) -> Vec<u8> {
        let encoded = self.encode(value);
        self.current = Some(value);
        self.encoded = Some(encoded.clone());
        encoded
    }

    fn admissible(&self, value: u64) -> bool {
        match &self.candidates {
            Some(values) => values.contains(&value),
            None => (self.mini..=self.maxi).contains(&value),
        }
    }
}

impl ValueCodec for UIntValue {
    fn kind(&self) -> &'static str {
        "uint"
    }

    fn produce(&mut self, rng: &mut dyn RngCore) -> Vec<u8> {
        let value = match (&self.candidates, self.determinist) {
            (Some(values), true) => {
                let value = values[self.cursor as usize];
                self.cursor += 1;
                if self.cursor as usize == values.len() {
                    self.cursor = 0;
                    self.exhausted = true;
                }
                value
            }
            (Some(values), false) => values[rng.random_range(0..values.len())],
            (None, true) => {
                let value = self.mini + self.cursor;
                if value >= self.maxi {
                    self.cursor = 0;
                    self.exhausted = true;
                } else {
                    self.cursor += 1;
                }
                value.min(self.maxi)
            }
            (None, false) => rng.random_range(self.mini..=self.maxi),
        };
        self.remember(value)
    }

    fn current(&self) -> Option<&[u8]> {
        self.encoded.as_deref()
    }

    fn set_value(&mut self, value: &[u8]) -> Result<(), ModelError> {
        if value.len() != self.width {
            return Err(ModelError::ValueRejected {
                reason: format!(
                    "expected {} byte(s) for integer, got {}",
                    self.width,
                    value.len()
                ),
            });
        }
        let decoded = self.decode(value);
        self.remember(decoded);
        Ok(())
    }

    fn absorb(&mut self, blob: &[u8], csts: &AbsorbConstraints) -> AbsorbOutcome {
        if blob.len() < self.width {
            return AbsorbOutcome::rejected();
        }
        let value = self.decode(&blob[..self.width]);
        if csts.contents && !self.admissible(value) {
            return AbsorbOutcome::rejected();
        }
        self.remember(value);
        AbsorbOutcome::matched(0, self.width)
    }

    fn make_determinist(&mut self) {
        self.determinist = true;
    }

    fn make_random(&mut self) {
        self.determinist = false;
    }

    fn rewind(&mut self) {
        if self.cursor == 0 {
            self.cursor = match &self.candidates {
                Some(values) => values.len() as u64 - 1,
                None => self.maxi - self.mini,
            };
        } else {
            self.cursor -= 1;
        }
    }

    fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    fn reset(&mut self) {
        self.cursor = 0;
        self.exhausted = false;
        self.current = None;
        self.encoded = None;
    }

    fn box_clone(&self) -> Box<dyn ValueCodec> {
        Box::new(self.clone())
    }

    fn as_int(&self) -> Option<i64> {
        self.current.map(|v| v.min(i64::MAX as u64) as i64)
    }

    fn set_int(&mut self, value: i64) -> bool {
        let clamped = value.max(0) as u64 & Self::max_for(self.width);
        self.remember(clamped);
        true
    }
}
