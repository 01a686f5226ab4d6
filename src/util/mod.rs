pub mod buf_ext;
pub mod random;
pub mod timer_queue;
