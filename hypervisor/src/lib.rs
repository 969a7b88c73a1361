#![cfg_attr(not(test), no_std)]
#![allow(clippy::new_without_default)]

extern crate alloc;

#[macro_use] extern crate static_assertions;

pub mod bits;
pub mod linux;
pub mod mem;
pub mod support;
pub mod svm;
pub mod vm;
