//! Types that live inside the guest machine.

pub mod coroutine;
pub mod function;
pub mod table;
pub mod value;
