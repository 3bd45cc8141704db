use tokio::sync::mpsc;

pub type Sender<T> = mpsc::Sender<T>;
pub type Receiver<T> = mpsc::Receiver<T>;

/// Capacity of the publisher-to-tracker update channel
pub const UPDATE_CHANNEL_SIZE: usize = 1024;

/// Bounded channel; a zero size is raised to one since tokio rejects it
pub fn create_channel<T>(buffer_size: usize) -> (Sender<T>, Receiver<T>) {
    mpsc::channel(buffer_size.max(1))
}
