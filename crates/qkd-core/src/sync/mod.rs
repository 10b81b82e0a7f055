//! Epoch alignment with the partner and clock-drift tracking.
mod epoch;
pub use epoch::{
    ChopperProgress, CommandPeakFinder, EpochWindow, PeakFinder, epoch_window, parse_peak_output,
    synchronize, wait_for_epochs,
};

mod frequency;
pub use frequency::{FrequencyCorrector, FrequencyUpdate};
