//! PPLNS payout computation.
//!
//! A [`Window`] is the most recent slice of the sharechain (newest first);
//! the [`Calculator`] turns it into a deterministic list of coinbase
//! payouts, weighted by per-share difficulty, with a finder fee and dust
//! consolidation.

mod calculator;
mod window;

pub use calculator::Calculator;
pub use window::Window;
