use std::io;
use std::process::ExitCode;
use std::sync::{Arc, mpsc};
use std::thread;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use clap::{Parser, ValueEnum};
use rtp::{Context, MediaStream, PayloadFormat, PushFlags, RtpFrame, StreamFlags};

#[derive(Clone, Copy, ValueEnum)]
enum Codec {
    H264,
    H265,
}

impl From<Codec> for PayloadFormat {
    fn from(codec: Codec) -> Self {
        match codec {
            Codec::H264 => PayloadFormat::H264,
            Codec::H265 => PayloadFormat::H265,
        }
    }
}

#[derive(Parser)]
#[command(
    name = "rtp-proxy",
    about = "Receive an H.264/H.265 RTP stream and forward every NAL unit to another endpoint"
)]
struct Args {
    /// Address the incoming stream is sent from
    #[arg(long, default_value = "127.0.0.1")]
    recv_addr: String,

    /// Port to receive on
    #[arg(long, default_value_t = 8890)]
    recv_port: u16,

    /// Address to forward to
    #[arg(long, default_value = "127.0.0.1")]
    send_addr: String,

    /// Port to forward to
    #[arg(long, default_value_t = 8891)]
    send_port: u16,

    #[arg(long, value_enum, default_value = "h264")]
    codec: Codec,

    /// Base64 SRTP master key, applied to both legs
    #[arg(long)]
    srtp_key: Option<String>,
}

fn nal_type_name(format: PayloadFormat, header: u8) -> String {
    match format {
        PayloadFormat::H265 => match (header >> 1) & 0x3F {
            t @ 16..=21 => format!("IRAP slice ({t})"),
            32 => "VPS".into(),
            33 => "SPS".into(),
            34 => "PPS".into(),
            35 => "AUD".into(),
            39 | 40 => "SEI".into(),
            t => t.to_string(),
        },
        _ => match header & 0x1F {
            1 => "Slice".into(),
            5 => "IDR slice".into(),
            6 => "SEI".into(),
            7 => "SPS".into(),
            8 => "PPS".into(),
            9 => "AUD".into(),
            t => t.to_string(),
        },
    }
}

fn forward(out: &MediaStream, format: PayloadFormat, frame: RtpFrame) {
    let Some(&first) = frame.payload.first() else {
        return;
    };
    tracing::info!(
        nal = %nal_type_name(format, first),
        bytes = frame.payload.len(),
        "forwarding"
    );
    if let Err(e) = out.push_frame_owned(frame.payload, PushFlags::NO_H26X_SCL) {
        tracing::error!(error = %e, "failed to send frame");
    }
}

/// Request a stop once a line arrives on `input`; end of input does not count.
fn watch_input<R: io::BufRead + Send + 'static>(
    mut input: R,
    stop: mpsc::Sender<&'static str>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut line = String::new();
        match input.read_line(&mut line) {
            Ok(0) => tracing::debug!("stdin closed; waiting for a signal"),
            Ok(_) => {
                let _ = stop.send("enter");
            }
            Err(e) => tracing::warn!(error = %e, "stdin unreadable; waiting for a signal"),
        }
    })
}

/// Block until Ctrl-C, SIGTERM or a line on stdin.
fn wait_for_stop() -> rtp::Result<()> {
    let (stop, stopped) = mpsc::channel();

    let on_signal = stop.clone();
    ctrlc::set_handler(move || {
        let _ = on_signal.send("signal");
    })
    .map_err(|e| rtp::RtpError::Generic(format!("signal handler: {e}")))?;

    watch_input(io::BufReader::new(io::stdin()), stop);

    if let Ok(reason) = stopped.recv() {
        tracing::info!(reason, "stopping");
    }
    Ok(())
}

fn run(args: Args) -> rtp::Result<()> {
    let format = PayloadFormat::from(args.codec);
    let key = match &args.srtp_key {
        Some(encoded) => Some(
            STANDARD
                .decode(encoded)
                .map_err(|e| rtp::RtpError::InvalidValue(format!("srtp key: {e}")))?,
        ),
        None => None,
    };
    let srtp = if key.is_some() {
        StreamFlags::SRTP | StreamFlags::SRTP_KMNGMNT_USER
    } else {
        StreamFlags::empty()
    };

    let ctx = Context::new();
    let rcv_session = ctx.create_session(&args.recv_addr)?;
    let snd_session = ctx.create_session(&args.send_addr)?;

    let rcv = rcv_session.create_unidirectional_stream(
        args.recv_port,
        format,
        StreamFlags::RECEIVE_ONLY | StreamFlags::NO_H26X_PREPEND_SC | srtp,
    )?;
    let snd = snd_session.create_unidirectional_stream(
        args.send_port,
        format,
        StreamFlags::SEND_ONLY | srtp,
    )?;
    if let Some(key) = &key {
        rcv.set_srtp_key(key)?;
        snd.set_srtp_key(key)?;
    }

    let out = Arc::clone(&snd);
    rcv.install_receive_hook(move |frame| forward(&out, format, frame))?;

    println!(
        "proxying {format} from port {} to {}:{}, press Enter or Ctrl-C to stop",
        args.recv_port, args.send_addr, args.send_port
    );
    wait_for_stop()?;

    rcv_session.destroy_stream(&rcv)?;
    snd_session.destroy_stream(&snd)?;
    ctx.destroy_session(&rcv_session)?;
    ctx.destroy_session(&snd_session)?;
    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt::init();

    match run(Args::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("rtp-proxy: {e}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn enter_requests_stop() {
        let (stop, stopped) = mpsc::channel();
        watch_input(Cursor::new(b"\n".to_vec()), stop).join().unwrap();
        assert_eq!(stopped.try_recv(), Ok("enter"));
    }

    #[test]
    fn closed_input_leaves_signals_in_charge() {
        let (stop, stopped) = mpsc::channel();
        watch_input(Cursor::new(Vec::new()), stop).join().unwrap();
        assert_eq!(stopped.try_recv(), Err(mpsc::TryRecvError::Disconnected));
    }

    #[test]
    fn nal_names_follow_codec() {
        assert_eq!(nal_type_name(PayloadFormat::H264, 0x65), "IDR slice");
        assert_eq!(nal_type_name(PayloadFormat::H265, 0x40), "VPS");
        assert_eq!(nal_type_name(PayloadFormat::H265, 0x26), "IRAP slice (19)");
    }
}
