#![deny(missing_docs)]
//! This lib provide several utilities for use in the `dhruva` project.

pub mod dns_resolver;
pub mod scanner;
pub mod wirestr;

pub use dns_resolver::*;
pub use scanner::*;
pub use wirestr::*;
