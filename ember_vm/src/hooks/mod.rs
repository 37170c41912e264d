//! Event hooks and hook lists.

mod hook;
mod list;

pub use hook::{
    DecodedHookFn, EventHook, HookArgs, HookFilter, HookFlags, HookFn, RawHookFn, ThreadFilter,
};
pub use list::{EventChange, HookList, HookScope, HookStat, LocalHooks, Removal};
