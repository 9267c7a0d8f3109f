//! External surfaces over the session pool.

pub mod http;
