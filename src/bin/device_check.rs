use genmedia_live::audio::AudioSource;
use genmedia_live::video::{encode_jpeg, letterbox, FrameSource};
use genmedia_live::{DeviceProvider, HostDevices, LiveConfig};
use std::error::Error;

fn check_microphone(devices: &HostDevices, config: &LiveConfig) -> Result<(), Box<dyn Error>> {
    let mut mic: Box<dyn AudioSource> = devices.open_microphone(config)?;
    let mut buf = vec![0.0f32; config.capture_sample_rate as usize];
    mic.read(&mut buf)?;
    let rms = (buf.iter().map(|s| s * s).sum::<f32>() / buf.len() as f32).sqrt();
    let peak = buf.iter().fold(0.0f32, |m, s| m.max(s.abs()));
    println!("  RMS {:.4}, peak {:.4} over 1 s", rms, peak);
    Ok(())
}

fn check_speaker(devices: &HostDevices, config: &LiveConfig) -> Result<(), Box<dyn Error>> {
    let mut speaker = devices.open_speaker(config)?;
    let rate = config.playback_sample_rate;
    let tone: Vec<f32> = (0..rate / 2)
        .map(|i| 0.2 * (2.0 * std::f32::consts::PI * 440.0 * i as f32 / rate as f32).sin())
        .collect();
    speaker.play(&tone, rate)?;
    println!("  Played 0.5 s at 440 Hz");
    Ok(())
}

fn check_frames(
    name: &str,
    mut source: Box<dyn FrameSource>,
    config: &LiveConfig,
) -> Result<(), Box<dyn Error>> {
    let frame = source.grab()?;
    let jpeg = encode_jpeg(&letterbox(&frame, config.frame_dimension), config.jpeg_quality)?;
    println!(
        "  {} {}x{} -> {} KB JPEG",
        name,
        frame.width(),
        frame.height(),
        jpeg.len() / 1024
    );
    Ok(())
}

fn report(label: &str, result: Result<(), Box<dyn Error>>) {
    match result {
        Ok(()) => println!("{} ✅", label),
        Err(e) => println!("{} ❌ {}", label, e),
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let config = LiveConfig::from_env()?;
    let devices = HostDevices { camera_index: 0 };

    println!("🎤 Microphone (speak now)");
    report("🎤", check_microphone(&devices, &config));

    println!("🔊 Speaker");
    report("🔊", check_speaker(&devices, &config));

    println!("📷 Camera");
    report(
        "📷",
        devices
            .open_camera(&config)
            .map_err(Into::into)
            .and_then(|source| check_frames("camera", source, &config)),
    );

    println!("🖥️ Screen");
    report(
        "🖥️",
        devices
            .open_screen(&config)
            .map_err(Into::into)
            .and_then(|source| check_frames("screen", source, &config)),
    );

    Ok(())
}
