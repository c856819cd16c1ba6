pub mod converge;
pub mod engine;
pub mod events;
pub mod http;
pub mod index;
pub mod queue;
pub mod registry;
pub mod remote;
pub mod resolver;
pub mod rolebinding;
pub mod selector;
pub mod synthesize;

#[cfg(test)]
mod testing;
