//! Sans-IO stream construction and assembly. Nothing in here touches a transport;
//! the engines feed it bytes and ship what it produces.

pub(crate) mod assemble;
pub(crate) mod buffer;
pub mod index;
pub(crate) mod selection;
pub(crate) mod serializer;
