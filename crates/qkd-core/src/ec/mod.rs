//! Error-correction work queue and QBER servo.
mod accumulator;
pub use accumulator::{EcAccumulator, EcBlock};

mod classify;
pub use classify::{DiagnosisClassifier, RawKeyClassifier, RawKeyInfo, parse_diagnosis};

mod note;
pub use note::{EcNote, NoteTracker, QberObserver};

mod queue;
pub use queue::{EcConsumer, EcQueue};

mod servo;
pub use servo::QberServo;
