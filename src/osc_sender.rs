use crate::error::InstrumentError;
use crate::instrument::{Instrument, PlayOptions};
use crate::notes::name_to_midi;
use crate::types::VisualCue;
use crossbeam_channel::Receiver;
use log::{debug, error, info, warn};
use rosc::{OscMessage, OscPacket, OscType};
use std::net::UdpSocket;

pub const NOTE_ADDR: &str = "/genie/note";
pub const CUE_ADDR: &str = "/genie/cue";

fn send(socket: &UdpSocket, target: &str, addr: &str, args: Vec<OscType>) -> Result<(), InstrumentError> {
    let msg = OscPacket::Message(OscMessage {
        addr: addr.to_string(),
        args,
    });
    let buf = rosc::encoder::encode(&msg)?;
    socket.send_to(&buf, target)?;
    Ok(())
}

/// Plays notes on an external synth: `/genie/note <name> <midi> <gain>`.
/// The start time is not sent; OSC receivers play on arrival.
pub struct OscInstrument {
    socket: UdpSocket,
    target: String,
    sent: u64,
}

impl OscInstrument {
    pub fn new(target: &str) -> Result<Self, InstrumentError> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        info!("OSC instrument → {}", target);
        Ok(Self {
            socket,
            target: target.to_string(),
            sent: 0,
        })
    }
}

impl Instrument for OscInstrument {
    fn play(&mut self, note: &str, _start: Option<f64>, options: PlayOptions) {
        let midi = name_to_midi(note).unwrap_or(-1);
        let args = vec![
            OscType::String(note.to_string()),
            OscType::Int(midi),
            OscType::Float(options.gain),
        ];
        match send(&self.socket, &self.target, NOTE_ADDR, args) {
            Ok(()) => self.sent += 1,
            Err(e) => debug!("OSC send error: {}", e),
        }
    }

    fn finish(&mut self) -> Result<(), InstrumentError> {
        info!("OSC instrument sent {} notes", self.sent);
        Ok(())
    }
}

/// Forwards visual cues to the scene as `/genie/cue <color> <intensity>`.
pub struct CueSender {
    rx: Receiver<VisualCue>,
    target: String,
}

impl CueSender {
    pub fn new(rx: Receiver<VisualCue>, target: String) -> Self {
        Self { rx, target }
    }

    /// Run the cue loop until the channel closes. Blocks the calling thread.
    pub fn run(&self) {
        let socket = match UdpSocket::bind("0.0.0.0:0") {
            Ok(s) => s,
            Err(e) => {
                error!("Failed to bind UDP socket: {}", e);
                return;
            }
        };
        info!("OSC cues → {}", self.target);

        for cue in self.rx.iter() {
            let args = vec![OscType::String(cue.color.clone()), OscType::Float(cue.intensity)];
            if let Err(e) = send(&socket, &self.target, CUE_ADDR, args) {
                warn!("cue {} not sent: {}", cue.trigger, e);
            }
        }
        info!("OSC cue sender shutting down");
    }
}
