use anyhow::Context;
use castcore_protocol::{BroadcasterConfig, CameraKind, DynamicTurnConfig, IceConfig, StaticIceConfig};

pub(crate) const DEFAULT_BITRATE: u32 = 4_000; // kbps, reasonable default for 1080p H.264
pub(crate) const DEFAULT_FRAMERATE: u32 = 30;

pub(crate) fn parse_args() -> anyhow::Result<BroadcasterConfig> {
    let mut signaling_url = String::new();
    let mut stream_id = String::new();
    let mut video_device_path = "/dev/video0".to_string();
    let mut audio_device_path: Option<String> = None;
    let mut camera_kind = CameraKind::Usb;
    let mut stun_urls: Vec<String> = vec![
        "stun:stun.l.google.com:19302".to_string(),
        "stun:stun1.l.google.com:19302".to_string(),
    ];
    let mut turn_url = None;
    let mut turn_username = None;
    let mut turn_password = None;

    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-V" | "--version" => {
                println!("castcore-broadcaster {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "-h" | "--help" => {
                print_help();
                std::process::exit(0);
            }
            "--signaling-url" => {
                i += 1;
                signaling_url = args.get(i).context("Missing --signaling-url value")?.clone();
            }
            "--stream-id" => {
                i += 1;
                stream_id = args.get(i).context("Missing --stream-id value")?.clone();
            }
            "--video-device" => {
                i += 1;
                video_device_path = args.get(i).context("Missing --video-device value")?.clone();
            }
            "--audio-device" => {
                i += 1;
                audio_device_path = Some(args.get(i).context("Missing --audio-device value")?.clone());
            }
            "--camera" => {
                i += 1;
                let raw = args.get(i).context("Missing --camera value")?;
                camera_kind = raw
                    .parse()
                    .map_err(|e: String| anyhow::anyhow!(e))
                    .context("Invalid --camera value")?;
            }
            "--stun" => {
                i += 1;
                stun_urls.push(args.get(i).context("Missing --stun value")?.clone());
            }
            "--turn-url" => {
                i += 1;
                turn_url = Some(args.get(i).context("Missing --turn-url value")?.clone());
            }
            "--turn-username" => {
                i += 1;
                turn_username = Some(args.get(i).context("Missing --turn-username value")?.clone());
            }
            "--turn-password" => {
                i += 1;
                turn_password = Some(args.get(i).context("Missing --turn-password value")?.clone());
            }
            other => anyhow::bail!("Unknown argument: {other}"),
        }
        i += 1;
    }

    if signaling_url.is_empty() {
        signaling_url = std::env::var("CASTCORE_SIGNALING_URL").unwrap_or_default();
    }

    let dynamic_turn = DynamicTurnConfig {
        endpoint: std::env::var("CASTCORE_TURN_ENDPOINT").ok(),
        key_id: std::env::var("CASTCORE_TURN_KEY_ID").ok(),
        api_token: std::env::var("CASTCORE_TURN_API_TOKEN").ok(),
        ..Default::default()
    };

    Ok(BroadcasterConfig {
        signaling_url,
        stream_id,
        video_device_path,
        audio_device_path,
        camera_kind,
        ice: IceConfig {
            static_servers: StaticIceConfig {
                stun_urls,
                turn_url,
                turn_username,
                turn_password,
            },
            dynamic_turn,
            credential_ttl_secs: 3600,
        },
    })
}

fn print_help() {
    println!("castcore-broadcaster - one-to-many live broadcast capture process");
    println!();
    println!("USAGE:");
    println!("    castcore-broadcaster [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    --signaling-url <URL>        Broker WebSocket URL (ws:// or wss://)");
    println!("    --stream-id <ID>             Stream identifier to register under");
    println!("    --video-device <PATH>        Video device node [default: /dev/video0]");
    println!("    --audio-device <PATH>        Audio capture device (omit to broadcast video-only)");
    println!("    --camera <KIND>              pi-modern | pi-legacy | usb [default: usb]");
    println!("    --stun <URL>                 Additional STUN server URL (repeatable)");
    println!("    --turn-url <URL>             Static TURN server URL");
    println!("    --turn-username <USER>       Static TURN username");
    println!("    --turn-password <PASS>       Static TURN password");
    println!("    -V, --version                Print version and exit");
    println!("    -h, --help                   Print this help and exit");
}
