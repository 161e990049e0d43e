pub mod server;

pub use server::{build_components, router, Components, ForwardAuthServer};
