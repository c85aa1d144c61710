//! Interactive capture-device picker for `--setup`.

use std::io::{self, Write};

use anyhow::{anyhow, Context, Result};
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyModifiers};
use crossterm::terminal;

use super::{is_bluetooth, AudioContext, DeviceInfo};

/// Raw-mode arrow/jk picker. With a single device there is nothing to pick;
/// Ctrl+C exits the process with the interactive-interrupt code.
pub fn select_device(ctx: &AudioContext) -> Result<Option<DeviceInfo>> {
    let devices = ctx.devices().context("enumerating devices")?;
    if devices.is_empty() {
        return Err(anyhow!("no capture devices found"));
    }
    if devices.len() == 1 {
        println!("Using device: {}", devices[0].name);
        return Ok(Some(devices[0].clone()));
    }

    terminal::enable_raw_mode().context("setting raw mode")?;
    let result = run_picker(&devices);
    let _ = terminal::disable_raw_mode();

    match result {
        Ok(PickOutcome::Picked(idx)) => {
            println!();
            Ok(Some(devices[idx].clone()))
        }
        Ok(PickOutcome::Interrupted) => {
            println!();
            std::process::exit(130);
        }
        Err(e) => Err(e),
    }
}

enum PickOutcome {
    Picked(usize),
    Interrupted,
}

fn render(devices: &[DeviceInfo], cursor: usize) {
    let mut out = io::stdout();
    let _ = write!(out, "\r\x1b[J");
    let _ = write!(out, "Select input device (up/down or j/k, Enter to confirm):\r\n\r\n");
    for (i, d) in devices.iter().enumerate() {
        let bt_tag = if is_bluetooth(&d.name) {
            " \x1b[33m[lower audio quality]\x1b[0m"
        } else {
            ""
        };
        if i == cursor {
            let _ = write!(out, "  \x1b[1;36m> {}{}\x1b[0m\r\n", d.name, bt_tag);
        } else {
            let _ = write!(out, "    {}{}\r\n", d.name, bt_tag);
        }
    }
    let _ = out.flush();
}

fn run_picker(devices: &[DeviceInfo]) -> Result<PickOutcome> {
    let mut cursor = 0usize;
    render(devices, cursor);

    loop {
        if let Event::Key(KeyEvent {
            code, modifiers, ..
        }) = event::read().context("reading input")?
        {
            match code {
                KeyCode::Enter => return Ok(PickOutcome::Picked(cursor)),
                KeyCode::Char('c') if modifiers.contains(KeyModifiers::CONTROL) => {
                    return Ok(PickOutcome::Interrupted)
                }
                KeyCode::Up | KeyCode::Char('k') => cursor = cursor.saturating_sub(1),
                KeyCode::Down | KeyCode::Char('j') => {
                    if cursor < devices.len() - 1 {
                        cursor += 1;
                    }
                }
                KeyCode::Esc => return Ok(PickOutcome::Interrupted),
                _ => {}
            }
        }

        // Move up over the rendered block and redraw in place.
        print!("\x1b[{}A", devices.len() + 2);
        render(devices, cursor);
    }
}
