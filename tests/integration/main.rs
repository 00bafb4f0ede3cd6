//! End-to-end tests over the public pipeline API.

mod mock_source;
mod pipeline;
