use etcd_client::{EventType, WatchStream as EtcdWatchStream};
use futures::stream::Stream;
use futures::StreamExt;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::errors::{MetadataError, Result};

#[derive(Debug)]
pub enum WatchEvent {
    Put {
        key: Vec<u8>,
        value: Vec<u8>,
        mod_revision: Option<i64>,
        version: Option<i64>,
    },
    Delete {
        key: Vec<u8>,
        mod_revision: Option<i64>,
        version: Option<i64>,
    },
}

impl WatchEvent {
    pub fn key(&self) -> &[u8] {
        match self {
            WatchEvent::Put { key, .. } => key,
            WatchEvent::Delete { key, .. } => key,
        }
    }
}

pub struct WatchStream {
    inner: Pin<Box<dyn Stream<Item = Result<WatchEvent>> + Send>>,
}

impl WatchStream {
    pub fn new<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<WatchEvent>> + Send + 'static,
    {
        Self {
            inner: Box::pin(stream),
        }
    }

    pub(crate) fn from_etcd(stream: EtcdWatchStream) -> Self {
        let stream = stream.flat_map(|result| {
            futures::stream::iter(
                result
                    .map_err(MetadataError::from)
                    .map(|watch_response| {
                        watch_response
                            .events()
                            .iter()
                            .filter_map(|event| {
                                let key_value = event.kv()?;
                                Some(match event.event_type() {
                                    EventType::Put => Ok(WatchEvent::Put {
                                        key: key_value.key().to_vec(),
                                        value: key_value.value().to_vec(),
                                        mod_revision: Some(key_value.mod_revision()),
                                        version: Some(key_value.version()),
                                    }),
                                    EventType::Delete => Ok(WatchEvent::Delete {
                                        key: key_value.key().to_vec(),
                                        mod_revision: Some(key_value.mod_revision()),
                                        version: Some(key_value.version()),
                                    }),
                                })
                            })
                            .collect::<Vec<_>>()
                    })
                    .into_iter()
                    .flatten(),
            )
        });

        Self {
            inner: Box::pin(stream),
        }
    }
}

impl Stream for WatchStream {
    type Item = Result<WatchEvent>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}
