//! PulseAudio microphone and speaker

use crate::audio::{AudioSink, AudioSource};
use crate::error::{LiveError, Result};
use libpulse_binding as pulse;
use libpulse_simple_binding as psimple;
use tracing::{debug, info};

fn mono_f32(rate: u32) -> pulse::sample::Spec {
    pulse::sample::Spec {
        format: pulse::sample::Format::F32le,
        channels: 1,
        rate,
    }
}

/// Default PulseAudio source, mono float at the requested rate.
pub struct PulseMicrophone {
    simple: psimple::Simple,
    bytes: Vec<u8>,
}

impl PulseMicrophone {
    pub fn open(app_name: &str, sample_rate: u32) -> Result<Self> {
        let spec = mono_f32(sample_rate);
        if !spec.is_valid() {
            return Err(LiveError::Device(format!("invalid capture spec {:?}", spec)));
        }

        let simple = psimple::Simple::new(
            None,
            app_name,
            pulse::stream::Direction::Record,
            None,
            "microphone",
            &spec,
            None,
            None,
        )
        .map_err(|e| LiveError::PermissionDenied(format!("microphone unavailable: {}", e)))?;

        info!("🎤 Microphone connected at {}Hz", sample_rate);
        Ok(Self {
            simple,
            bytes: Vec::new(),
        })
    }
}

impl AudioSource for PulseMicrophone {
    fn read(&mut self, buf: &mut [f32]) -> Result<()> {
        self.bytes.resize(buf.len() * 4, 0);
        self.simple
            .read(&mut self.bytes)
            .map_err(|e| LiveError::Device(format!("microphone read failed: {}", e)))?;

        for (sample, raw) in buf.iter_mut().zip(self.bytes.chunks_exact(4)) {
            *sample = f32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
        }
        Ok(())
    }
}

/// Default PulseAudio sink. One stream per rate, reopened when the rate changes.
pub struct PulseSpeaker {
    app_name: String,
    stream: Option<(u32, psimple::Simple)>,
}

impl PulseSpeaker {
    pub fn open(app_name: &str, sample_rate: u32) -> Result<Self> {
        let mut speaker = Self {
            app_name: app_name.to_string(),
            stream: None,
        };
        speaker.stream_for(sample_rate)?;
        Ok(speaker)
    }

    fn stream_for(&mut self, rate: u32) -> Result<&psimple::Simple> {
        let reopen = !matches!(&self.stream, Some((current, _)) if *current == rate);
        if reopen {
            debug!("Opening playback stream at {}Hz", rate);
            let simple = psimple::Simple::new(
                None,
                &self.app_name,
                pulse::stream::Direction::Playback,
                None,
                "model audio",
                &mono_f32(rate),
                None,
                None,
            )
            .map_err(|e| LiveError::Playback(format!("speaker unavailable: {}", e)))?;
            self.stream = Some((rate, simple));
        }
        match &self.stream {
            Some((_, simple)) => Ok(simple),
            None => Err(LiveError::Playback("no playback stream".to_string())),
        }
    }
}

impl AudioSink for PulseSpeaker {
    fn play(&mut self, samples: &[f32], sample_rate: u32) -> Result<()> {
        let mut bytes = Vec::with_capacity(samples.len() * 4);
        for sample in samples {
            bytes.extend_from_slice(&sample.to_le_bytes());
        }

        let stream = self.stream_for(sample_rate)?;
        stream
            .write(&bytes)
            .map_err(|e| LiveError::Playback(format!("write failed: {}", e)))?;
        // Block until played out so segments never overlap.
        stream
            .drain()
            .map_err(|e| LiveError::Playback(format!("drain failed: {}", e)))?;
        Ok(())
    }
}
