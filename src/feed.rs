//! Packets handed to the host's streaming sink.

/// One unit of acquisition output, consumed in emission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Packet<'a> {
    /// Raw samples, `unitsize` bytes each, little endian.
    Logic { data: &'a [u8], unitsize: usize },
    /// The trigger fired between the previous and the next logic packet.
    Trigger,
    /// No more packets follow for this acquisition.
    End,
}

impl Packet<'_> {
    /// Number of samples carried by a logic packet.
    pub fn sample_count(&self) -> usize {
        match self {
            Packet::Logic { data, unitsize } if *unitsize > 0 => data.len() / unitsize,
            _ => 0,
        }
    }
}

/// Receiver for acquisition output.
pub trait DataFeed {
    fn send(&mut self, packet: Packet<'_>);
}

impl<F> DataFeed for F
where
    F: FnMut(Packet<'_>),
{
    fn send(&mut self, packet: Packet<'_>) {
        self(packet)
    }
}
