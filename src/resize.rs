use std::num::NonZeroUsize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResizeDirection {
    Grow,
    Shrink,
}

/// Outcome of one heap evaluation. An amount of zero means "leave the heap alone"
/// whatever the direction says.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResizeDecision {
    pub amount: usize,
    pub direction: ResizeDirection,
}

impl ResizeDecision {
    pub const NONE: Self = Self {
        amount: 0,
        direction: ResizeDirection::Shrink,
    };

    pub const fn grow(amount: usize) -> Self {
        Self {
            amount,
            direction: ResizeDirection::Grow,
        }
    }

    pub const fn shrink(amount: usize) -> Self {
        Self {
            amount,
            direction: ResizeDirection::Shrink,
        }
    }

    pub const fn is_noop(&self) -> bool {
        self.amount == 0
    }

    /// Returns what has to be done to the heap, or `None` when nothing has to.
    pub fn action(&self) -> Option<(NonZeroUsize, ResizeDirection)> {
        NonZeroUsize::new(self.amount).map(|amount| (amount, self.direction))
    }
}

impl Default for ResizeDecision {
    fn default() -> Self {
        Self::NONE
    }
}
