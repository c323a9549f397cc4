//! In-memory transport: a pair of cross-connected sockets.

use super::VirtualSocket;

/// Builds two sockets whose outboxes feed each other's inboxes directly.
///
/// Everything sent on one side becomes receivable on the other, which is
/// all a same-process endpoint pair or a test needs.
pub fn pair(capacity: usize) -> (VirtualSocket, VirtualSocket) {
    let a = VirtualSocket::new(capacity);
    let b = VirtualSocket::new(capacity);
    let deliver_to_b = b.clone();
    a.connect_sink(move |bytes| deliver_to_b.deliver(&bytes))
        .expect("fresh outbox cannot be connected");
    let deliver_to_a = a.clone();
    b.connect_sink(move |bytes| deliver_to_a.deliver(&bytes))
        .expect("fresh outbox cannot be connected");
    (a, b)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::task::Task;

    #[async_std::test]
    async fn round_trip() {
        let (a, b) = pair(8);
        let task = Task::new();

        a.send(b"ping".to_vec()).unwrap();
        assert_eq!(b.recv(|_| true, &task).await, Ok(b"ping".to_vec()));

        b.send(b"pong".to_vec()).unwrap();
        assert_eq!(a.recv(|_| true, &task).await, Ok(b"pong".to_vec()));
    }

    #[async_std::test]
    async fn sends_before_pairing_drain_in_order() {
        let a = VirtualSocket::new(8);
        a.send(b"one".to_vec()).unwrap();
        a.send(b"two".to_vec()).unwrap();

        let b = VirtualSocket::new(8);
        let deliver_to_b = b.clone();
        a.connect_sink(move |bytes| deliver_to_b.deliver(&bytes))
            .unwrap();

        let task = Task::new();
        assert_eq!(b.recv(|_| true, &task).await, Ok(b"one".to_vec()));
        assert_eq!(b.recv(|_| true, &task).await, Ok(b"two".to_vec()));
    }
}
