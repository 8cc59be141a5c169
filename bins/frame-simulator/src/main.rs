use std::collections::HashSet;
use std::net::UdpSocket;
use std::time::Duration;

use clap::Parser;
use rand::seq::SliceRandom;

use aperture_receiver::dummy_udp::PacketHeader;

#[derive(Parser)]
#[command(
    name = "frame-simulator",
    about = "Generates dummy UDP frame streams against a frame receiver"
)]
struct Cli {
    /// Destination host.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Destination ports; frames alternate between them.
    #[arg(long, default_value = "8989,8990", value_delimiter = ',')]
    ports: Vec<u16>,

    /// Number of frames to send.
    #[arg(long, default_value_t = 10)]
    frames: u32,

    /// Packets per frame.
    #[arg(long, default_value_t = 2)]
    packets_per_frame: u32,

    /// Payload bytes per packet.
    #[arg(long, default_value_t = 8000)]
    packet_size: usize,

    /// Pause between frames in milliseconds.
    #[arg(long, default_value_t = 10)]
    interval_ms: u64,

    /// Packets to drop, as comma-separated frame:packet pairs
    /// (e.g. `3:0,7:1`), for exercising timeout handling.
    #[arg(long, value_delimiter = ',')]
    drop_packets: Vec<String>,

    /// Shuffle the packet order within each frame.
    #[arg(long)]
    shuffle: bool,

    /// Logging verbosity, 0 (quiet) to 3 (trace).
    #[arg(long, default_value_t = 1)]
    debug_level: u8,
}

fn parse_drop_list(entries: &[String]) -> Result<HashSet<(u32, u32)>, String> {
    let mut drops = HashSet::new();
    for entry in entries {
        let (frame, packet) = entry
            .split_once(':')
            .ok_or_else(|| format!("bad drop entry '{entry}', expected frame:packet"))?;
        let frame = frame
            .parse::<u32>()
            .map_err(|e| format!("bad frame in '{entry}': {e}"))?;
        let packet = packet
            .parse::<u32>()
            .map_err(|e| format!("bad packet in '{entry}': {e}"))?;
        drops.insert((frame, packet));
    }
    Ok(drops)
}

/// Build the datagrams of one frame: packet header plus a payload derived
/// from the frame and packet numbers, so receivers can verify placement.
fn build_frame_packets(frame: u32, packets_per_frame: u32, packet_size: usize) -> Vec<Vec<u8>> {
    (0..packets_per_frame)
        .map(|packet| {
            let sof = packet == 0;
            let eof = packet == packets_per_frame - 1;
            let mut datagram = PacketHeader::encode(frame, packet, sof, eof).to_vec();
            datagram.extend(
                (0..packet_size).map(|i| (frame as usize + packet as usize + i) as u8),
            );
            datagram
        })
        .collect()
}

fn main() {
    let cli = Cli::parse();
    let level = match cli.debug_level {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| level.into()),
        )
        .init();

    let drops = match parse_drop_list(&cli.drop_packets) {
        Ok(drops) => drops,
        Err(e) => {
            tracing::error!(error = %e, "bad drop list");
            std::process::exit(1);
        }
    };
    if cli.ports.is_empty() {
        tracing::error!("at least one destination port is required");
        std::process::exit(1);
    }

    let socket = match UdpSocket::bind("0.0.0.0:0") {
        Ok(socket) => socket,
        Err(e) => {
            tracing::error!(error = %e, "failed to open send socket");
            std::process::exit(2);
        }
    };

    tracing::info!(
        frames = cli.frames,
        packets_per_frame = cli.packets_per_frame,
        packet_size = cli.packet_size,
        "sending frame stream"
    );

    let mut rng = rand::thread_rng();
    let mut packets_sent = 0u64;
    let mut packets_dropped = 0u64;

    for frame in 0..cli.frames {
        let port = cli.ports[frame as usize % cli.ports.len()];
        let mut packets: Vec<(u32, Vec<u8>)> =
            build_frame_packets(frame, cli.packets_per_frame, cli.packet_size)
                .into_iter()
                .enumerate()
                .map(|(packet, datagram)| (packet as u32, datagram))
                .collect();
        if cli.shuffle {
            packets.shuffle(&mut rng);
        }

        for (packet, datagram) in packets {
            if drops.contains(&(frame, packet)) {
                tracing::debug!(frame, packet, "dropping packet");
                packets_dropped += 1;
                continue;
            }
            if let Err(e) = socket.send_to(&datagram, (cli.host.as_str(), port)) {
                tracing::error!(frame, packet, error = %e, "send failed");
                std::process::exit(1);
            }
            packets_sent += 1;
        }

        tracing::debug!(frame, port, "frame sent");
        std::thread::sleep(Duration::from_millis(cli.interval_ms));
    }

    tracing::info!(packets_sent, packets_dropped, "frame stream complete");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packets_carry_sof_and_eof_flags() {
        let packets = build_frame_packets(3, 3, 16);
        assert_eq!(packets.len(), 3);

        let first = PacketHeader::parse(&packets[0]).unwrap();
        assert!(first.start_of_frame);
        assert!(!first.end_of_frame);
        assert_eq!(first.frame_number, 3);

        let last = PacketHeader::parse(&packets[2]).unwrap();
        assert!(last.end_of_frame);
        assert_eq!(last.packet_number, 2);
    }

    #[test]
    fn payload_pattern_depends_on_frame_and_packet() {
        let packets = build_frame_packets(1, 2, 4);
        assert_eq!(&packets[0][8..], &[1, 2, 3, 4]);
        assert_eq!(&packets[1][8..], &[2, 3, 4, 5]);
    }

    #[test]
    fn drop_list_parses_pairs() {
        let drops = parse_drop_list(&["3:0".into(), "7:1".into()]).unwrap();
        assert!(drops.contains(&(3, 0)));
        assert!(drops.contains(&(7, 1)));
        assert!(parse_drop_list(&["nope".into()]).is_err());
    }
}
