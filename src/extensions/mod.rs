//! Optional transport extensions.
//!
//! | Module        | Feature       | Description                          |
//! |---------------|---------------|--------------------------------------|
//! | `compression` | `compression` | zstd compression of packet bodies    |

mod compression;

pub use compression::*;
