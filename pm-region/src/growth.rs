//! Capacity arithmetic shared by every growable region.

/// Computes new mapping capacities.
///
/// The policy is stateless: `next(capacity, min) = max(min, capacity * factor)`, rounded up to a
/// multiple of `granule`. Regions partitioned into slots use the slot size as granule so that
/// their capacity stays a whole number of slots.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GrowthPolicy {
    factor: usize,
    granule: usize,
}

/// The outcome of applying a [`GrowthPolicy`] until a minimum is met.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Growth {
    /// The new capacity, at least the requested minimum.
    pub capacity: usize,
    /// How often `next` was applied.
    pub steps: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum GrowthError {
    /// The capacity can not be represented in the address space.
    #[error("requested capacity of {requested} bytes overflows the address space")]
    Overflow { requested: usize },
    #[error("growth factor must be at least 2, got {0}")]
    Factor(usize),
    #[error("growth granule must not be zero")]
    Granule,
}

impl GrowthPolicy {
    pub const DEFAULT_FACTOR: usize = 2;

    /// Mappings can never exceed `isize::MAX` bytes.
    const LIMIT: usize = isize::MAX as usize;

    pub fn new(factor: usize) -> Result<Self, GrowthError> {
        if factor < 2 {
            return Err(GrowthError::Factor(factor));
        }

        Ok(GrowthPolicy { factor, granule: 1 })
    }

    /// Use a different rounding unit for computed capacities.
    pub fn with_granule(self, granule: usize) -> Result<Self, GrowthError> {
        if granule == 0 {
            return Err(GrowthError::Granule);
        }

        Ok(GrowthPolicy { granule, ..self })
    }

    pub fn factor(&self) -> usize {
        self.factor
    }

    pub fn granule(&self) -> usize {
        self.granule
    }

    /// Round `len` up to the granule.
    pub fn align(&self, len: usize) -> Result<usize, GrowthError> {
        let rem = len % self.granule;
        let aligned = if rem == 0 {
            len
        } else {
            len.checked_add(self.granule - rem)
                .ok_or(GrowthError::Overflow { requested: len })?
        };

        if aligned > Self::LIMIT {
            return Err(GrowthError::Overflow { requested: len });
        }

        Ok(aligned)
    }

    /// One growth step.
    pub fn next(&self, capacity: usize, requested: usize) -> Result<usize, GrowthError> {
        // A saturated multiplication still yields a valid candidate, `align` rejects it.
        let scaled = capacity.saturating_mul(self.factor);
        self.align(requested.max(scaled))
    }

    /// Apply `next` until the capacity covers `requested`.
    ///
    /// Returns `None` when `capacity` already suffices.
    pub fn grow(&self, capacity: usize, requested: usize) -> Result<Option<Growth>, GrowthError> {
        if capacity >= requested {
            return Ok(None);
        }

        let mut growth = Growth { capacity, steps: 0 };
        while growth.capacity < requested {
            growth.capacity = self.next(growth.capacity, requested)?;
            growth.steps += 1;
        }

        Ok(Some(growth))
    }
}

impl Default for GrowthPolicy {
    fn default() -> Self {
        GrowthPolicy {
            factor: Self::DEFAULT_FACTOR,
            granule: 1,
        }
    }
}

#[test]
fn doubles_when_request_is_small() {
    let policy = GrowthPolicy::default();
    assert_eq!(policy.next(4096, 4097), Ok(8192));
    assert_eq!(
        policy.grow(4096, 4097),
        Ok(Some(Growth {
            capacity: 8192,
            steps: 1
        }))
    );
}

#[test]
fn jumps_straight_to_large_requests() {
    let policy = GrowthPolicy::default();
    let growth = policy.grow(4, 1 << 20).unwrap().unwrap();
    assert_eq!(growth.capacity, 1 << 20);
    // Bounded by ceil(log2(requested / initial)).
    assert!(growth.steps <= 18);
}

#[test]
fn no_growth_when_covered() {
    let policy = GrowthPolicy::default();
    assert_eq!(policy.grow(8192, 8192), Ok(None));
    assert_eq!(policy.grow(8192, 10), Ok(None));
}

#[test]
fn from_empty_capacity() {
    let policy = GrowthPolicy::default();
    assert_eq!(policy.grow(0, 10).unwrap().unwrap().capacity, 10);
}

#[test]
fn granule_rounds_to_slots() {
    let policy = GrowthPolicy::default().with_granule(1000).unwrap();
    assert_eq!(policy.align(0), Ok(0));
    assert_eq!(policy.align(1), Ok(1000));
    assert_eq!(policy.align(2000), Ok(2000));
    // max(2500, 2 * 1000) rounded up.
    assert_eq!(policy.next(1000, 2500), Ok(3000));
}

#[test]
fn rejects_degenerate_policies() {
    assert_eq!(GrowthPolicy::new(1), Err(GrowthError::Factor(1)));
    assert_eq!(
        GrowthPolicy::default().with_granule(0),
        Err(GrowthError::Granule)
    );
}

#[test]
fn overflow_is_reported() {
    let policy = GrowthPolicy::default();
    assert!(matches!(
        policy.grow(1, usize::MAX),
        Err(GrowthError::Overflow { .. })
    ));
}
