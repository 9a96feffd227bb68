pub use crate::comm::endpoint::{Endpoint, EndpointEvents, Phase, Response};
pub use crate::comm::frame::FunctionCode;
pub use crate::comm::link::{Link, LinkKind};
pub use crate::comm::message::EMPTY_ADDR;
pub use crate::comm::payload::Generation;
pub use crate::comm::shared::ErrorKind;
