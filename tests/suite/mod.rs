mod lifecycle;
mod pull;
mod sync;
