//! Site orderings for each phase of a finite-system DMRG run.
//!
//! Every two-site window is identified by its left site `s`, covering sites
//! `(s, s + 1)`. Optimizing a window in the [`Right`][Direction::Right]
//! direction leaves the orthogonality center on bond `s` with site `s`
//! left-isometric; optimizing in the [`Left`][Direction::Left] direction does
//! the same but is entered from bond `s + 1`. The functions here produce
//! orderings in which each step starts where the previous one left the
//! center:
//! - before a rightward step at `s`, the center is on bond `s - 1`;
//! - before a leftward step at `s`, the center is on bond `s + 1`.
//!
//! Windows range over `1 ≤ s ≤ L - 3`. The pair at the turning point of a
//! sweep is not optimized twice: a rightward pass ends at `L - 3` and the
//! following leftward pass begins at `L - 4`; a leftward pass ends at `1` and
//! the following rightward pass begins at `2`.

use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScheduleError {
    /// Returned when a direction tag is anything other than `l` or `r`.
    #[error("invalid direction {0:?}: must be one of 'l' or 'r'")]
    InvalidDirection(String),

    /// Returned when a chain is too short to be swept.
    #[error("chain length {0} is too short: must be at least {min}", min = MIN_LENGTH)]
    ShortChain(usize),
}
use ScheduleError::*;
pub type ScheduleResult<T> = Result<T, ScheduleError>;

/// Shortest chain that can be swept.
pub const MIN_LENGTH: usize = 4;

/// Direction of travel of the orthogonality center.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    Left,
    Right,
}

impl Direction {
    /// Short tag used in text output: `l` or `r`.
    pub fn tag(&self) -> char {
        match self {
            Self::Left => 'l',
            Self::Right => 'r',
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.tag())
    }
}

impl FromStr for Direction {
    type Err = ScheduleError;

    fn from_str(s: &str) -> ScheduleResult<Self> {
        match s.trim() {
            "l" | "L" | "left" => Ok(Self::Left),
            "r" | "R" | "right" => Ok(Self::Right),
            _ => Err(InvalidDirection(s.to_string())),
        }
    }
}

/// A single step in a sweep.
pub type Step = (usize, Direction);

fn check(length: usize) -> ScheduleResult<()> {
    if length < MIN_LENGTH { Err(ShortChain(length)) } else { Ok(()) }
}

/// Site pairs `(l, r)` optimized during infinite-system growth, in order.
///
/// Sites `0` and `L - 1` (and, for odd `L`, site `1`) are fixed boundary
/// tensors; growth fills in the rest from the outside in, ending with `r = l +
/// 1` at the middle of the chain.
pub fn growth(length: usize) -> ScheduleResult<Vec<(usize, usize)>> {
    check(length)?;
    let half = length / 2;
    let odd = length % 2;
    Ok((1..half).map(|i| (i + odd, length - 1 - i)).collect())
}

/// Bond holding the orthogonality center once growth has finished.
pub fn center_after_growth(length: usize) -> ScheduleResult<usize> {
    check(length)?;
    Ok(length / 2 - 1 + length % 2)
}

/// Steps taking the center from the middle of the chain to the right end and
/// then back to bond `1`.
pub fn first_half(length: usize) -> ScheduleResult<Vec<Step>> {
    let start = center_after_growth(length)? + 1;
    Ok(
        (start..=length - 3).map(|s| (s, Direction::Right))
            .chain((1..=length - 4).rev().map(|s| (s, Direction::Left)))
            .collect()
    )
}

/// One full sweep, starting and ending with the center on bond `1`.
pub fn full(length: usize) -> ScheduleResult<Vec<Step>> {
    check(length)?;
    Ok(
        (2..=length - 3).map(|s| (s, Direction::Right))
            .chain((1..=length - 4).rev().map(|s| (s, Direction::Left)))
            .collect()
    )
}

/// A single rightward pass, starting with the center on bond `1`.
pub fn final_pass(length: usize) -> ScheduleResult<Vec<Step>> {
    check(length)?;
    Ok((2..=length - 3).map(|s| (s, Direction::Right)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    // track the center through a sequence of steps, checking that each step
    // starts where the previous one ended
    fn walk(mut center: usize, steps: &[Step], length: usize) -> usize {
        for &(s, dir) in steps {
            assert!(s >= 1 && s + 2 < length, "window {s} out of range for L={length}");
            match dir {
                Direction::Right => assert_eq!(center, s - 1, "L={length}, step {s}{dir}"),
                Direction::Left => assert_eq!(center, s + 1, "L={length}, step {s}{dir}"),
            }
            center = s;
        }
        center
    }

    #[test]
    fn schedules_chain_together() {
        for length in MIN_LENGTH..20 {
            let pairs = growth(length).unwrap();
            let (l, r) = *pairs.last().unwrap();
            assert_eq!(r, l + 1);
            assert_eq!(l, center_after_growth(length).unwrap());

            let c = walk(l, &first_half(length).unwrap(), length);
            assert_eq!(c, if length > 4 { 1 } else { l });
            let c = walk(1, &full(length).unwrap(), length);
            assert_eq!(c, 1);
            walk(c, &final_pass(length).unwrap(), length);
        }
    }

    #[test]
    fn growth_covers_every_interior_site() {
        for length in MIN_LENGTH..20 {
            let mut seen: Vec<usize>
                = growth(length).unwrap().into_iter()
                .flat_map(|(l, r)| [l, r])
                .collect();
            seen.sort_unstable();
            let first = 1 + length % 2;
            assert_eq!(seen, (first..length - 1).collect::<Vec<_>>());
        }
    }

    #[test]
    fn sweep_lengths() {
        assert_eq!(full(10).unwrap().len(), 2 * 10 - 8);
        assert_eq!(full(4).unwrap().len(), 0);
        assert_eq!(final_pass(10).unwrap().len(), 6);
        assert_eq!(first_half(10).unwrap()[0], (5, Direction::Right));
        assert_eq!(first_half(9).unwrap()[0], (5, Direction::Right));
    }

    #[test]
    fn parse_direction() {
        assert_eq!("l".parse::<Direction>().unwrap(), Direction::Left);
        assert_eq!("r".parse::<Direction>().unwrap(), Direction::Right);
        assert!(matches!("x".parse::<Direction>(), Err(InvalidDirection(_))));
        assert!(matches!(full(3), Err(ShortChain(3))));
    }
}
