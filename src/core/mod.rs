//! The BLE session coordinator: facade, scan session, connection registry,
//! and characteristic operation router.

mod coordinator;
mod registry;
mod router;
mod scan;

pub use coordinator::Coordinator;
pub use registry::{ConnectionRegistry, DeviceConnection};
pub use router::OperationRouter;
pub use scan::ScanSession;
