//! Last will handling.
//!
//! The will registered at CONNECT is published when the connection ends for
//! any reason other than a DISCONNECT packet or broker shutdown.

use quaymq_core::{Publish, Will};

use crate::router::TopicRouter;

/// Convert a CONNECT will into the message it stands for.
pub fn will_to_publish(will: Will) -> Publish {
    Publish::new(will.topic, will.message, will.qos, will.retain)
}

/// A connection's will, armed until cleared.
#[derive(Debug, Default)]
pub struct PendingWill(Option<Publish>);

impl PendingWill {
    pub fn new(will: Option<Will>) -> Self {
        Self(will.map(will_to_publish))
    }

    pub fn is_armed(&self) -> bool {
        self.0.is_some()
    }

    /// Drop the will after a clean DISCONNECT.
    pub fn clear(&mut self) {
        self.0 = None;
    }

    /// Publish the will if still armed. Returns the number of deliveries.
    pub fn fire(&mut self, router: &TopicRouter) -> usize {
        match self.0.take() {
            Some(publish) => {
                log::debug!("Publishing will on '{}'", publish.topic);
                router.publish(&publish)
            }
            None => 0,
        }
    }
}
