mod gate;
mod state_machine;

pub use gate::SnapshotGate;
pub use gate::SnapshotRefused;
pub use state_machine::CatchupError;
pub use state_machine::CatchupFuture;
pub use state_machine::InstallSnapshotError;
pub use state_machine::JournalStateMachine;
pub use state_machine::Mode;
pub use state_machine::SnapshotError;
pub use state_machine::SuspendError;
