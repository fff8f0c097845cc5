use bytes::Bytes;

/// A request or response travelling between the pool and a worker.
///
/// `body` carries the application data, `context` carries opaque metadata
/// accompanying it. Either side may be empty; the default value is the
/// designated empty payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Payload {
    pub body: Bytes,
    pub context: Bytes,
}

impl Payload {
    pub fn new(body: impl Into<Bytes>, context: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            context: context.into(),
        }
    }

    pub fn from_body(body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            context: Bytes::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty() && self.context.is_empty()
    }
}
