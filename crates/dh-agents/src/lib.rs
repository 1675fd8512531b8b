pub mod cli;
pub mod events;
pub mod lifecycle;
pub mod prelaunch;
pub mod runtime;
pub mod scheduler;
pub mod state_machine;
pub mod supervisor;
