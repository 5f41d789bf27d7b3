pub mod accept;
pub mod master;
pub mod server;
pub mod signal;
pub mod task;

pub use accept::{AcceptBackend, AcceptMutex};
pub use master::{MAX_PROCESS, Master, WorkerRecord};
pub use server::{Server, ServerConfig};
pub use task::{Conduit, HEARTBEAT_LIMIT, Outbox, Request, Task};
pub use warren_network as network;
pub use warren_utils as utils;
