//! Asynchronous request/response message queue: pending-request tracking,
//! timeout, and multi-address failover (§4.2).

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, Mutex};
use tokio::time::timeout;
use tracing::debug;

use crate::addr::{Addr, Contact};
use crate::id::Id;
use crate::wire::Action;
use crate::{DhtError, Result, NET_TIMEOUT_SECS};

/// A reply delivered to a pending request: the resolved peer identity
/// (possibly only now learned from the reply) and the decoded payload.
pub struct Reply {
    pub peer_id: Option<Id>,
    pub addr: Addr,
    pub payload: Vec<u8>,
}

struct PendingItem {
    id: Option<Id>,
    addr: Addr,
    action: Action,
    msg_id: u64,
    sender: Option<oneshot::Sender<Reply>>,
}

/// Tracks outstanding RPCs keyed by `(peer, action, msg_id)` and resolves
/// them from `satisfy`, or times them out after `NET_TIMEOUT_SECS`.
#[derive(Default)]
pub struct MessageQueue {
    items: Mutex<VecDeque<PendingItem>>,
}

impl MessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pending request and wait for its reply or timeout.
    ///
    /// Matches an incoming `satisfy` by `(id **or** addr) **and** action
    /// **and** msg_id **and** not-yet-satisfied` (§4.2).
    pub async fn await_reply(&self, id: Option<Id>, addr: Addr, action: Action, msg_id: u64) -> Result<Reply> {
        let (tx, rx) = oneshot::channel();
        {
            let mut items = self.items.lock().await;
            items.push_back(PendingItem {
                id,
                addr: addr.clone(),
                action,
                msg_id,
                sender: Some(tx),
            });
        }

        match timeout(Duration::from_secs(NET_TIMEOUT_SECS), rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(DhtError::Timeout),
            Err(_) => {
                self.remove(id, addr, action, msg_id).await;
                Err(DhtError::Timeout)
            }
        }
    }

    /// Resolve a pending request, if one exists matching by identity/address,
    /// action, and msg_id. Silently drops the message otherwise (§4.2).
    pub async fn satisfy(&self, id: Option<Id>, addr: Addr, action: Action, msg_id: u64, payload: Vec<u8>) {
        let mut items = self.items.lock().await;
        let pos = items.iter().position(|it| {
            it.action == action
                && it.msg_id == msg_id
                && (it.addr == addr || (id.is_some() && it.id == id))
        });
        let Some(pos) = pos else {
            debug!(msg_id, "no pending entry for reply, dropping");
            return;
        };
        let mut item = items.remove(pos).expect("position is valid");
        if let Some(sender) = item.sender.take() {
            let _ = sender.send(Reply { peer_id: id, addr, payload });
        }
    }

    /// Whether a matching, unsatisfied pending entry exists (used to
    /// deduplicate concurrent queries from the same sender).
    pub async fn pending(&self, addr: &Addr, action: Action, msg_id: u64) -> bool {
        let items = self.items.lock().await;
        items.iter().any(|it| it.addr == *addr && it.action == action && it.msg_id == msg_id)
    }

    async fn remove(&self, id: Option<Id>, addr: Addr, action: Action, msg_id: u64) {
        let mut items = self.items.lock().await;
        if let Some(pos) = items
            .iter()
            .position(|it| it.action == action && it.msg_id == msg_id && (it.addr == addr || (id.is_some() && it.id == id)))
        {
            items.remove(pos);
        }
    }
}

/// Send to a contact's addresses in order, failing over to the next address
/// on timeout until the list is exhausted (§4.2 Failover).
///
/// `send_one` performs the actual datagram send to a single address; it is
/// called once per address attempted.
pub async fn send_with_failover<F, Fut>(
    queue: Arc<MessageQueue>,
    contact: &Contact,
    action: Action,
    msg_id: u64,
    mut send_one: F,
) -> Result<Reply>
where
    F: FnMut(Addr) -> Fut,
    Fut: std::future::Future<Output = Result<()>>,
{
    let mut addresses = contact.addresses.clone();
    loop {
        let Some(addr) = addresses.first().cloned() else {
            return Err(DhtError::Timeout);
        };

        send_one(addr.clone()).await?;
        match queue.await_reply(Some(contact.id), addr.clone(), action, msg_id).await {
            Ok(reply) => return Ok(reply),
            Err(DhtError::Timeout) => {
                addresses.remove(0);
                if addresses.is_empty() {
                    return Err(DhtError::Timeout);
                }
                debug!(addr = %addr, "message expired, trying next address");
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::Transport;

    fn addr(port: u16) -> Addr {
        Addr::new(Transport::Udp, "127.0.0.1", port)
    }

    #[tokio::test]
    async fn test_satisfy_resolves_pending() {
        let queue = Arc::new(MessageQueue::new());
        let a = addr(1);

        let queue2 = queue.clone();
        let a2 = a.clone();
        let satisfier = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            queue2.satisfy(None, a2, Action::Ping, 1, b"pong".to_vec()).await;
        });

        let reply = queue.await_reply(None, a, Action::Ping, 1).await.expect("reply arrives");
        assert_eq!(reply.payload, b"pong");
        satisfier.await.expect("satisfier task completes");
    }

    #[tokio::test]
    async fn test_satisfy_without_pending_is_noop() {
        let queue = MessageQueue::new();
        queue.satisfy(None, addr(2), Action::Ping, 1, b"x".to_vec()).await;
        assert!(!queue.pending(&addr(2), Action::Ping, 1).await);
    }

    #[tokio::test]
    async fn test_timeout_when_unsatisfied() {
        let queue = MessageQueue::new();
        let result = tokio::time::timeout(
            Duration::from_millis(50),
            queue.await_reply(None, addr(3), Action::Ping, 1),
        )
        .await;
        assert!(result.is_err(), "should not resolve before NET_TIMEOUT");
    }

    #[tokio::test]
    async fn test_pending_reports_unsatisfied_entry() {
        let queue = Arc::new(MessageQueue::new());
        let a = addr(4);

        let queue2 = queue.clone();
        let a2 = a.clone();
        let waiter = tokio::spawn(async move { queue2.await_reply(None, a2, Action::Ping, 7).await });

        // Give the waiter a chance to register before checking `pending`.
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(queue.pending(&a, Action::Ping, 7).await);
        queue.satisfy(None, a.clone(), Action::Ping, 7, vec![]).await;
        let _ = waiter.await;
    }

    #[tokio::test]
    async fn test_failover_resolves_via_first_address() {
        let queue = Arc::new(MessageQueue::new());
        let contact = Contact::new(Id::ZERO, vec![addr(10), addr(11)]);
        let sent = Arc::new(tokio::sync::Mutex::new(Vec::new()));

        let queue2 = queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            queue2.satisfy(None, addr(10), Action::Ping, 1, b"ok".to_vec()).await;
        });

        let result = send_with_failover(queue.clone(), &contact, Action::Ping, 1, |a| {
            let sent = sent.clone();
            async move {
                sent.lock().await.push(a);
                Ok(())
            }
        })
        .await;

        assert!(result.is_ok());
        let attempted = sent.lock().await;
        assert_eq!(attempted.as_slice(), &[addr(10)]);
    }
}
