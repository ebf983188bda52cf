//! Note arithmetic: register resolution for model output, and the
//! MIDI ⇄ name ⇄ Hz conversions used at the instrument boundary.

/// MIDI number of the lowest piano key (A0). The model's key 0 maps here.
pub const LOWEST_PIANO_MIDI_NUMBER: i32 = 21;
/// Lowest note the celesta samples cover well (A5).
pub const LOWEST_INSTRUMENT_MIDI_NUMBER: i32 = 81;
/// Sampling temperature used for every voice unless configured otherwise.
pub const GENIE_TEMPERATURE: f32 = 0.25;

const NOTE_NAMES: [&str; 12] = [
    "C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B",
];

/// Map a raw model key index onto an absolute MIDI note no lower than
/// `minimum_note`, moving up by whole octaves so the pitch class survives.
///
/// `raw + base_offset` is returned unchanged when it already clears the
/// floor. Otherwise it is raised by the smallest number of octaves that
/// reaches `minimum_note`.
///
/// Never overflows. A result past `i32::MAX` comes back down by octaves
/// while it stays on the floor; when no octave fits it saturates to
/// `i32::MAX`.
pub fn resolve(raw: i32, base_offset: i32, minimum_note: i32) -> i32 {
    let note = raw as i64 + base_offset as i64;
    let floor = minimum_note as i64;
    let mut out = if note >= floor {
        note
    } else {
        note + 12 * ceil_octaves(floor - note)
    };
    let top = i32::MAX as i64;
    if out > top {
        let lowered = out - 12 * ceil_octaves(out - top);
        if lowered < floor {
            return i32::MAX;
        }
        out = lowered;
    }
    out as i32
}

/// Octaves needed to cover a positive semitone span.
fn ceil_octaves(span: i64) -> i64 {
    (span + 11) / 12
}

/// Scientific pitch name with sharps, e.g. 60 → "C4", 81 → "A5".
/// This is the name format the sample player resolves to files.
pub fn midi_to_name(midi: i32) -> String {
    let pc = midi.rem_euclid(12);
    let oct = midi.div_euclid(12) - 1;
    format!("{}{}", NOTE_NAMES[pc as usize], oct)
}

/// Parse a scientific pitch name ("A5", "C#4", "Db4", "B-1") back to MIDI.
pub fn name_to_midi(name: &str) -> Option<i32> {
    let mut chars = name.chars();
    let letter = chars.next()?.to_ascii_uppercase();
    let mut pc: i32 = match letter {
        'C' => 0,
        'D' => 2,
        'E' => 4,
        'F' => 5,
        'G' => 7,
        'A' => 9,
        'B' => 11,
        _ => return None,
    };
    let rest = chars.as_str();
    let octave_str = match rest.chars().next() {
        Some('#') => {
            pc += 1;
            &rest[1..]
        }
        Some('b') => {
            pc -= 1;
            &rest[1..]
        }
        _ => rest,
    };
    let octave: i32 = octave_str.parse().ok()?;
    Some((octave + 1) * 12 + pc)
}

/// Convert MIDI note number (fractional) to Hz. A4 = MIDI 69 = 440 Hz.
pub fn midi_to_hz(midi: f64) -> f64 {
    440.0 * 2.0_f64.powf((midi - 69.0) / 12.0)
}
