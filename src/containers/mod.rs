//! Lock-free containers built on the DHP SMR runtime (`SPEC_FULL.md`
//! §4.8, §4.9).

mod elimination;
pub mod michael_list;
pub mod treiber_stack;
