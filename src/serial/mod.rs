pub mod link;
pub mod mock;
pub mod port;
pub mod simulated;
pub mod state;
pub mod supervisor;

pub use link::{ChunkSource, CommandSink, PortLink, PortProvider, ReadOutcome};
pub use port::{list_ports, PortEntry, SerialPortProvider};
pub use simulated::{SimulatedProvider, SimulationConfig};
pub use state::ConnectionState;
pub use supervisor::{ConnectionSupervisor, SupervisorConfig};
