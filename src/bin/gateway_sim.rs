//! Gateway Simulator
//!
//! Simulates a LoRa gateway speaking the Semtech UDP Packet Forwarder
//! protocol against a running bridge. Useful for testing without hardware.
//!
//! Usage: cargo run --bin gateway-sim [server_addr]

use std::env;
use std::net::SocketAddr;

use base64::Engine;
use chrono::Utc;
use gwmp_bridge::udp::data_rate::DataRate;
use gwmp_bridge::udp::protocol::{
    GatewayEui, GwmpPacket, Modulation, PushDataPayload, Rxpk, Stat, TxAckPayload, TxError,
    TxPacketAck,
};
use tokio::net::UdpSocket;
use tokio::time::{sleep, Duration, Instant};

/// Fake gateway EUI
const GATEWAY_EUI: GatewayEui = GatewayEui([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF, 0x00, 0x11]);

/// How long to wait for PULL_RESP after the uplinks
const LISTEN_FOR: Duration = Duration::from_secs(30);
const KEEPALIVE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let server_addr: SocketAddr = env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:1700".to_string())
        .parse()?;

    println!("🌊 GWMP Gateway Simulator");
    println!("  Target: {}", server_addr);
    println!("  Gateway EUI: {}", GATEWAY_EUI);
    println!();

    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    let started = Instant::now();
    let mut token: u16 = 0x1000;

    // Open the downlink path first
    token = token.wrapping_add(1);
    println!("📡 Sending: PULL_DATA");
    exchange(&socket, server_addr, pull_data(token)).await?;
    println!();

    // DevAddr=260B1234 FCnt=66 FPort=1, temperature 22.5°C
    let temperature = [
        0x40, 0x34, 0x12, 0x0B, 0x26, 0x80, 0x42, 0x00, 0x01, 0x00, 0xE1, 0x78, 0x56, 0x34, 0x12,
    ];
    // DevAddr=260B5678 FCnt=7 FPort=2, door open
    let door = [
        0x80, 0x78, 0x56, 0x0B, 0x26, 0x00, 0x07, 0x00, 0x02, 0x01, 0xDD, 0xCC, 0xBB, 0xAA,
    ];

    let scenarios = vec![
        (
            "Unconfirmed Data Up (temperature sensor)",
            lora_uplink(&started, 902.3, "SF7BW125", -65.0, 7.5, &temperature),
        ),
        (
            "Confirmed Data Up (door sensor)",
            lora_uplink(&started, 903.9, "SF10BW125", -112.0, -5.0, &door),
        ),
        (
            "FSK uplink (50 kbps)",
            PushDataPayload {
                rxpk: vec![fsk_uplink(&started, &[0xCA, 0xFE, 0xBA, 0xBE])],
                stat: None,
            },
        ),
        (
            "Gateway Status",
            PushDataPayload {
                rxpk: Vec::new(),
                stat: Some(status()),
            },
        ),
    ];

    for (desc, payload) in scenarios {
        token = token.wrapping_add(1);
        let packet = GwmpPacket::PushData {
            random_token: token,
            gateway_eui: GATEWAY_EUI,
            payload,
        }
        .encode();

        println!("📡 Sending: {}", desc);
        println!("   Size: {} bytes", packet.len());
        exchange(&socket, server_addr, packet).await?;
        println!();

        sleep(Duration::from_secs(1)).await;
    }

    println!("👂 Listening for downlinks for {:?}...", LISTEN_FOR);
    let deadline = Instant::now() + LISTEN_FOR;
    let mut keepalive = tokio::time::interval(KEEPALIVE);
    let mut buf = [0u8; 65535];

    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => break,
            _ = keepalive.tick() => {
                token = token.wrapping_add(1);
                socket.send_to(&pull_data(token), server_addr).await?;
            }
            res = socket.recv_from(&mut buf) => {
                let (len, from) = res?;
                match GwmpPacket::decode(&buf[..len]) {
                    Ok(GwmpPacket::PullResp { random_token, payload }) => {
                        let txpk = payload.txpk;
                        println!(
                            "   📥 PULL_RESP (token 0x{:04x}): {} MHz, {}, {} bytes{}",
                            random_token,
                            txpk.freq,
                            txpk.datr,
                            txpk.size,
                            if txpk.imme { " (immediate)" } else { "" }
                        );
                        let ack = GwmpPacket::TxAck {
                            random_token,
                            gateway_eui: GATEWAY_EUI,
                            payload: Some(TxAckPayload {
                                txpk_ack: TxPacketAck {
                                    error: TxError::None,
                                    warn: None,
                                },
                            }),
                        };
                        socket.send_to(&ack.encode(), from).await?;
                        println!("   ✅ TX_ACK sent");
                    }
                    Ok(GwmpPacket::PullAck { .. }) => {}
                    Ok(other) => {
                        println!("   ⚠️  Unexpected {:?} from {}", other.packet_type(), from)
                    }
                    Err(e) => println!("   ❌ Undecodable datagram from {}: {}", from, e),
                }
            }
        }
    }

    println!("✨ Simulation complete!");
    Ok(())
}

fn pull_data(token: u16) -> Vec<u8> {
    GwmpPacket::PullData {
        random_token: token,
        gateway_eui: GATEWAY_EUI,
    }
    .encode()
}

/// Send a request and wait for its ack
async fn exchange(socket: &UdpSocket, server: SocketAddr, packet: Vec<u8>) -> anyhow::Result<()> {
    socket.send_to(&packet, server).await?;

    let mut ack_buf = [0u8; 64];
    match tokio::time::timeout(Duration::from_secs(2), socket.recv_from(&mut ack_buf)).await {
        Ok(Ok((len, from))) => match GwmpPacket::decode(&ack_buf[..len]) {
            Ok(ack @ (GwmpPacket::PushAck { .. } | GwmpPacket::PullAck { .. })) => {
                println!("   ✅ {:?} received from {}", ack.packet_type(), from);
            }
            Ok(other) => println!("   ⚠️  Unexpected {:?} from {}", other.packet_type(), from),
            Err(e) => println!(
                "   ⚠️  Unexpected response ({} bytes) from {}: {}",
                len, from, e
            ),
        },
        Ok(Err(e)) => println!("   ❌ Recv error: {}", e),
        Err(_) => println!("   ⏰ No ACK (timeout)"),
    }
    Ok(())
}

/// Concentrator counter: microseconds since the simulator started
fn tmst(started: &Instant) -> u32 {
    started.elapsed().as_micros() as u32
}

fn b64(data: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(data)
}

fn lora_uplink(
    started: &Instant,
    freq: f64,
    datr: &str,
    rssi: f64,
    lsnr: f64,
    phy: &[u8],
) -> PushDataPayload {
    PushDataPayload {
        rxpk: vec![Rxpk {
            time: Some(Utc::now().to_rfc3339()),
            tmms: None,
            tmst: tmst(started),
            freq,
            chan: 0,
            rfch: 0,
            stat: Some(1),
            modu: Modulation::Lora,
            datr: DataRate::Lora(datr.to_string()),
            codr: Some("4/5".to_string()),
            rssi: Some(rssi),
            lsnr: Some(lsnr),
            size: phy.len() as u16,
            data: b64(phy),
        }],
        stat: None,
    }
}

fn fsk_uplink(started: &Instant, phy: &[u8]) -> Rxpk {
    Rxpk {
        time: Some(Utc::now().to_rfc3339()),
        tmms: None,
        tmst: tmst(started),
        freq: 868.8,
        chan: 8,
        rfch: 1,
        stat: Some(1),
        modu: Modulation::Fsk,
        datr: DataRate::Fsk(50_000),
        codr: None,
        rssi: Some(-80.0),
        lsnr: None,
        size: phy.len() as u16,
        data: b64(phy),
    }
}

fn status() -> Stat {
    Stat {
        time: Some(Utc::now()),
        lati: Some(29.7604),
        long: Some(-95.3698),
        alti: Some(15),
        rxnb: Some(47),
        rxok: Some(44),
        rxfw: Some(44),
        ackr: Some(100.0),
        dwnb: Some(3),
        txnb: Some(3),
    }
}
