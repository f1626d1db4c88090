pub mod comm;
pub mod config;
pub mod core;
mod de;
mod error;
mod header;
mod io;
mod profiling;
mod reader;
mod ser;
pub mod staging;
pub mod transform;
pub mod transport;
mod types;
mod variable;
mod writer;

pub use comm::{Communicator, SelfComm, ThreadComm};
pub use config::{ConfigMode, EngineConfig, TransportConfig};
pub use crate::core::index::{Attribute, IndexEntry, VariableInfo};
pub use error::{Error, Result};
pub use io::Io;
pub use profiling::{Profiler, Timer};
pub use reader::BpReader;
pub use staging::{StagingReader, StagingWriter};
pub use transform::{Compression, Transform, TransformHandle, TransformRegistry};
pub use types::{
    constants, Dims, Element, ElementType, Mode, Params, ShapeKind, StepMode, StepStatus,
    LOCAL_VALUE_DIM,
};
pub use variable::{TransformInfo, Variable};
pub use writer::{BpWriter, WriterState};

#[doc(hidden)]
pub use comde;
