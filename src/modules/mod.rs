//! Modules shipped with the runtime.

pub mod debug;

use crate::vm::Module;

/// Every built-in module, in load order.
pub fn builtin() -> Vec<Module> {
    vec![debug::module()]
}
