//! Per-connection signalling sessions.
//!
//! Every accepted WebSocket runs one session task. A session either books a
//! fresh slot or joins an existing one; once a booker and a joiner have
//! been paired, each side's task becomes the relay pump for its own read
//! direction. The whole session, pairing wait and relaying alike, lives
//! under a single deadline.

use std::time::Duration;

use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use tokio::time;
use tokio_tungstenite::WebSocketStream;
use tokio_util::{sync::CancellationToken, task::AbortOnDropHandle};
use tracing::{debug, warn};
use tungstenite::protocol::Message;

use super::streams::MaybeTlsStream;
use crate::{defaults::timeouts::CLOSE_WRITE_TIMEOUT, protocol::Close, slots::SlotTable};

/// A relayed peer connection.
pub(crate) type Conn = WebSocketStream<MaybeTlsStream>;

type ConnSink = SplitSink<Conn, Message>;
type ConnStream = SplitStream<Conn>;

/// The value exchanged through the rendezvous channel at pairing time: the
/// peer's write half, and the token that tears the pair down.
pub(crate) struct PeerHalf {
    sink: ConnSink,
    pair: CancellationToken,
}

/// The slot table instantiated for peer connections.
pub(crate) type Slots = SlotTable<PeerHalf>;

/// Runs one signalling session to completion.
///
/// `slot` is the URL path remainder after the relay prefix: empty books a
/// new slot, anything else joins the slot with that code.
pub(crate) async fn run(conn: Conn, slot: &str, slots: &Slots, slot_timeout: Duration) {
    let cancel = CancellationToken::new();
    let _deadline = deadline(cancel.clone(), slot_timeout);
    if slot.is_empty() {
        book(conn, slots, &cancel).await;
    } else {
        join(conn, slot, slots, &cancel).await;
    }
}

/// Cancels `cancel` once `after` has elapsed.
///
/// The timer is aborted when the returned handle drops, i.e. when the
/// session ends before its deadline.
fn deadline(cancel: CancellationToken, after: Duration) -> AbortOnDropHandle<()> {
    AbortOnDropHandle::new(tokio::spawn(async move {
        time::sleep(after).await;
        cancel.cancel();
    }))
}

/// The booking branch: allocate a slot, tell the peer its code, wait for a
/// joiner.
async fn book(mut conn: Conn, slots: &Slots, cancel: &CancellationToken) {
    let (code, mut booking) = match slots.reserve() {
        Ok(reservation) => reservation,
        Err(err) => {
            warn!("{err:#}");
            close(conn, Close::NoMoreSlots).await;
            return;
        }
    };
    debug!(%code, "book");

    if let Err(err) = conn.send(Message::Text(code.clone())).await {
        debug!(%code, "failed to send slot code: {err:#}");
        slots.release(&code);
        return;
    }

    let claim = tokio::select! {
        _ = cancel.cancelled() => {
            debug!(%code, "timeout");
            slots.release(&code);
            close(conn, Close::SlotTimedOut).await;
            return;
        }
        _ = watch_booker(&mut conn) => {
            slots.release(&code);
            return;
        }
        claimed = booking.joined() => match claimed {
            Ok(claim) => claim,
            Err(_) => {
                // The entry was taken but the joiner dropped out before
                // the handshake; nothing is coming any more.
                debug!(%code, "joiner abandoned the slot");
                slots.release(&code);
                return;
            }
        }
    };

    let pair = CancellationToken::new();
    let (sink, stream) = conn.split();
    let half = PeerHalf {
        sink,
        pair: pair.clone(),
    };
    let remote = match claim.exchange(half).await {
        Ok(remote) => remote,
        Err(_) => {
            debug!(%code, "joiner abandoned the handshake");
            return;
        }
    };
    debug!(%code, "rendezvous");

    pump(stream, remote.sink, cancel, &pair).await;
}

/// The joining branch: take the slot, exchange halves with its booker.
async fn join(mut conn: Conn, code: &str, slots: &Slots, cancel: &CancellationToken) {
    let Some(entry) = slots.take(code) else {
        debug!(%code, "no such slot");
        close(conn, Close::NoSuchSlot).await;
        return;
    };
    debug!(%code, "join");

    let mut pending = match entry.claim() {
        Ok(pending) => pending,
        Err(_) => {
            // The booker vanished between our take() and the claim.
            debug!(%code, "booker already gone");
            close(conn, Close::NoSuchSlot).await;
            return;
        }
    };

    let offer = tokio::select! {
        _ = cancel.cancelled() => {
            debug!(%code, "timeout before pairing");
            close(conn, Close::SlotTimedOut).await;
            return;
        }
        offered = pending.offered() => match offered {
            Ok(offer) => offer,
            Err(_) => {
                debug!(%code, "booker abandoned the handshake");
                close(conn, Close::NoSuchSlot).await;
                return;
            }
        }
    };

    let pair = offer.value().pair.clone();
    let (sink, stream) = conn.split();
    let remote = offer.accept(PeerHalf {
        sink,
        pair: pair.clone(),
    });
    debug!(%code, "rendezvous");

    pump(stream, remote.sink, cancel, &pair).await;
}

/// Reads from the booker while it waits for a joiner.
///
/// Resolves when the booker disconnects, errors, or violates the protocol
/// by sending a frame before pairing. There is nobody to forward to yet, so
/// a data frame at this stage means a broken client and the session is torn
/// down without a close code.
async fn watch_booker(conn: &mut Conn) {
    loop {
        match conn.next().await {
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
            Some(Ok(Message::Close(_))) | None => {
                debug!("booker disconnected before pairing");
                return;
            }
            Some(Ok(_)) => {
                warn!("booker sent data before pairing");
                return;
            }
            Some(Err(err)) => {
                debug!("booker read failed before pairing: {err:#}");
                return;
            }
        }
    }
}

/// Forwards frames from `from` to the paired peer's `to` until either
/// connection fails, either peer closes, or a deadline fires.
///
/// Text and binary frames are forwarded verbatim, one in flight at a time;
/// WebSocket control frames stay local to each hop. Cancelling `pair` stops
/// the opposite direction as well, so the pair always goes down together.
async fn pump(mut from: ConnStream, mut to: ConnSink, cancel: &CancellationToken, pair: &CancellationToken) {
    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => break,
            _ = pair.cancelled() => break,
            msg = from.next() => msg,
        };
        match msg {
            Some(Ok(msg @ Message::Text(_))) | Some(Ok(msg @ Message::Binary(_))) => {
                let sent = tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = pair.cancelled() => break,
                    sent = to.send(msg) => sent,
                };
                if let Err(err) = sent {
                    debug!("relay write failed: {err:#}");
                    break;
                }
            }
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
            Some(Ok(_)) | None => break,
            Some(Err(err)) => {
                debug!("relay read failed: {err:#}");
                break;
            }
        }
    }
    pair.cancel();
    // Start a close handshake towards the peer we were writing to; its own
    // pump does the same for our side.
    if time::timeout(CLOSE_WRITE_TIMEOUT, to.close()).await.is_err() {
        debug!("timed out closing relayed connection");
    }
}

/// Sends an application close frame and drops the connection.
async fn close(mut conn: Conn, reason: Close) {
    let frame = Message::Close(Some(reason.frame()));
    match time::timeout(CLOSE_WRITE_TIMEOUT, conn.send(frame)).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => debug!("failed to send close frame: {err:#}"),
        Err(_) => debug!("timed out sending close frame"),
    }
}
