pub mod line_buffer;
pub mod stderr_filter;
