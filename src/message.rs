/// A single unit of work delivered by a [`crate::Consumer`].
///
/// `id` and `stream` identify the exact entry so it can be acknowledged
/// with [`crate::Consumer::ack`]; `group` is carried along so the ack
/// batcher can route the XACK/XDEL pair without a second lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub body: String,
    pub id: String,
    pub stream: String,
    pub group: String,
}
