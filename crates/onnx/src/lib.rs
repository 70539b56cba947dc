pub mod error;
pub mod lower;
pub mod model;
pub mod proto;
pub mod session;

pub use error::{OnnxError, Result};
pub use lower::{LoweringStats, has_qdq, lower_qdq};
pub use model::{ensure_opset, graph, graph_mut, io_metadata, read_model, write_model};
pub use session::OnnxSession;
