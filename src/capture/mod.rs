use anyhow::{Context, Result};
use pcap::{Capture, Offline};
use std::path::Path;

use crate::protocol::LinkType;

pub struct PacketData<'a> {
    pub data: &'a [u8],
}

/// A pcap or pcapng capture file opened for reading.
pub struct PacketSource {
    cap: Capture<Offline>,
    link_type: LinkType,
}

impl PacketSource {
    pub fn from_file(path: &Path, bpf: Option<&str>) -> Result<Self> {
        let mut cap = Capture::from_file(path)
            .context(format!("Failed to open pcap file: {}", path.display()))?;

        if let Some(filter) = bpf {
            cap.filter(filter, true)
                .context(format!("Invalid BPF filter: {}", filter))?;
        }

        let link_type = link_type_from_pcap(cap.get_datalink());
        Ok(PacketSource { cap, link_type })
    }

    pub fn link_type(&self) -> LinkType {
        self.link_type
    }

    /// Iterate over packets, calling `f` for each one.
    /// Return `false` from `f` to stop reading.
    pub fn for_each_packet<F>(&mut self, mut f: F) -> Result<()>
    where
        F: FnMut(PacketData) -> bool,
    {
        loop {
            match self.cap.next_packet() {
                Ok(packet) => {
                    if !f(PacketData { data: packet.data }) {
                        break;
                    }
                }
                Err(pcap::Error::NoMorePackets) => break,
                Err(e) => return Err(e).context("Failed to read packet"),
            }
        }

        Ok(())
    }
}

fn link_type_from_pcap(dl: pcap::Linktype) -> LinkType {
    match dl.0 {
        1 => LinkType::Ethernet,     // DLT_EN10MB
        12 | 101 => LinkType::RawIp, // DLT_RAW
        113 => LinkType::LinuxSll,   // DLT_LINUX_SLL
        _ => {
            tracing::warn!(
                link_type = dl.0,
                name = %dl.get_name().unwrap_or_default(),
                "unsupported link type, assuming Ethernet"
            );
            LinkType::Ethernet
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_link_types() {
        assert_eq!(link_type_from_pcap(pcap::Linktype(1)), LinkType::Ethernet);
        assert_eq!(link_type_from_pcap(pcap::Linktype(101)), LinkType::RawIp);
        assert_eq!(link_type_from_pcap(pcap::Linktype(113)), LinkType::LinuxSll);
    }

    #[test]
    fn unknown_link_type_falls_back_to_ethernet() {
        assert_eq!(link_type_from_pcap(pcap::Linktype(147)), LinkType::Ethernet);
    }

    #[test]
    fn missing_file_is_an_error() {
        let err = PacketSource::from_file(Path::new("/nonexistent/capture.pcap"), None)
            .err()
            .unwrap();
        assert!(err.to_string().contains("Failed to open pcap file"));
    }
}
