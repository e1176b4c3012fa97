//! The one-shot rendezvous channel used to pair a booking peer with a
//! joining peer.
//!
//! A channel carries exactly one value in each direction and is then spent.
//! The handshake has three steps: the joiner *claims* the slot, the booker
//! *offers* its value, the joiner *answers* with its own. The claim step
//! means the booker blocks until a joiner is actively waiting and keeps
//! ownership of its value until that moment; the joiner likewise holds its
//! own value through every cancellable wait. Dropping either side at any
//! stage wakes the other with [`Abandoned`].

use tokio::sync::oneshot;

/// Creates a new rendezvous channel.
///
/// The [`Booking`] half stays with the booking task; the [`Entry`] half is
/// published in the slot table for a joiner to take.
pub(crate) fn channel<T>() -> (Booking<T>, Entry<T>) {
    let (ready_tx, ready_rx) = oneshot::channel();
    (Booking { ready: ready_rx }, Entry { ready: ready_tx })
}

/// The counterpart dropped out of the rendezvous.
#[derive(Debug, thiserror::Error)]
#[error("counterpart abandoned the rendezvous")]
pub(crate) struct Abandoned;

/// The booker's half of the channel, held while waiting for a joiner.
pub(crate) struct Booking<T> {
    ready: oneshot::Receiver<Claim<T>>,
}

/// The table's half of the channel, taken over by the joiner.
pub(crate) struct Entry<T> {
    ready: oneshot::Sender<Claim<T>>,
}

/// Proof that a joiner is waiting, received by the booker.
pub(crate) struct Claim<T> {
    offer: oneshot::Sender<(T, oneshot::Sender<T>)>,
}

/// The joiner's half after claiming, waiting for the booker's offer.
pub(crate) struct Pending<T> {
    offer: oneshot::Receiver<(T, oneshot::Sender<T>)>,
}

/// The booker's value, plus the slot for the joiner's answer.
pub(crate) struct Offer<T> {
    value: T,
    answer: oneshot::Sender<T>,
}

impl<T> Booking<T> {
    /// Waits until a joiner claims the slot.
    ///
    /// Cancel-safe: no value has been committed to the channel yet.
    pub(crate) async fn joined(&mut self) -> Result<Claim<T>, Abandoned> {
        (&mut self.ready).await.map_err(|_| Abandoned)
    }
}

impl<T> Claim<T> {
    /// Sends the booker's value and waits for the joiner's in return.
    ///
    /// The wait only spans the joiner's synchronous [`Offer::accept`], so
    /// this resolves promptly once the offer is delivered.
    pub(crate) async fn exchange(self, value: T) -> Result<T, Abandoned> {
        let (answer_tx, answer_rx) = oneshot::channel();
        self.offer.send((value, answer_tx)).map_err(|_| Abandoned)?;
        answer_rx.await.map_err(|_| Abandoned)
    }
}

impl<T> Entry<T> {
    /// Claims the slot, announcing that a joiner is waiting.
    pub(crate) fn claim(self) -> Result<Pending<T>, Abandoned> {
        let (offer_tx, offer_rx) = oneshot::channel();
        self.ready
            .send(Claim { offer: offer_tx })
            .map_err(|_| Abandoned)?;
        Ok(Pending { offer: offer_rx })
    }
}

impl<T> Pending<T> {
    /// Waits for the booker's offer.
    ///
    /// Cancel-safe: the joiner's own value is not committed until
    /// [`Offer::accept`].
    pub(crate) async fn offered(&mut self) -> Result<Offer<T>, Abandoned> {
        let (value, answer) = (&mut self.offer).await.map_err(|_| Abandoned)?;
        Ok(Offer { value, answer })
    }
}

impl<T> Offer<T> {
    /// The booker's value.
    pub(crate) fn value(&self) -> &T {
        &self.value
    }

    /// Completes the exchange: hands `value` to the booker and returns the
    /// booker's value.
    pub(crate) fn accept(self, value: T) -> T {
        // The booker has no suspension point between sending the offer and
        // awaiting the answer, so this only fails if its task died.
        let _ = self.answer.send(value);
        self.value
    }
}
