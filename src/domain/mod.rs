pub mod aligner;
pub mod backlog;
pub mod models;
pub mod packet;
pub mod pipeline;
pub mod ring_buffer;
pub mod settings;
