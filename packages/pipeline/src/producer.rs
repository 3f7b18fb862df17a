//! Producer: pulls deliveries from a bus subscription into the pipeline.

use tokio::sync::mpsc;

use crate::bus::{BusSubscription, Delivery};

/// Pull deliveries until the subscription closes, pushing them into the
/// bounded pipeline channel. The channel capacity is the pipeline's max
/// demand; a full channel backpressures the pull loop.
pub(crate) async fn run_producer(
    mut subscription: Box<dyn BusSubscription>,
    tx: mpsc::Sender<Delivery>,
) {
    while let Some(delivery) = subscription.next().await {
        if tx.send(delivery).await.is_err() {
            // Processors are gone; the delivery's drop nacks it.
            break;
        }
    }
    tracing::info!("Producer stopped: subscription closed");
}
