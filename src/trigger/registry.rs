//! Static trigger function registry (§4.7, §9: "model as a static registry
//! mapping `&'static str -> fn(...)`. No dynamic loading is needed.").
//!
//! `COPY`, `SUM_UINT`, `ROLLING_AVG_DOUBLE_20`, `MAX_DOUBLE`, `MIN_DOUBLE`
//! are direct ports of `original_source/include/lib/trigger/basic.h`'s
//! registry. The remaining names from §6's recognized FUNCTION_NAME list
//! (`DAQ_ADC_SCALE`, `MAX31855K_THERMOCOUPLE`, `PCB1403_CURRENT_EXCITE`,
//! `PRESSURE_TRANSDUCER_8252`, and the four `*_STATE_TO_STR` decoders) have
//! no surviving header in the retrieved original-source pack; they are
//! implemented from their names' domain convention (ADC/thermocouple/
//! load-cell/pressure-sensor scaling, enum-to-string decoding) in the same
//! function shape as `basic.h`'s entries (see DESIGN.md).

use std::sync::OnceLock;

use crate::viewer::Viewer;
use crate::writer::Writer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    Success,
    NoChange,
    Failure,
}

pub type TriggerFn = fn(&Viewer, &mut Writer, &[String]) -> TriggerOutcome;

fn registry() -> &'static [(&'static str, TriggerFn)] {
    static REGISTRY: OnceLock<Vec<(&'static str, TriggerFn)>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        vec![
            ("COPY", copy as TriggerFn),
            ("SUM_UINT", sum_uint as TriggerFn),
            ("ROLLING_AVG_DOUBLE_20", rolling_avg_double_20 as TriggerFn),
            ("MAX_DOUBLE", max_double as TriggerFn),
            ("MIN_DOUBLE", min_double as TriggerFn),
            ("DAQ_ADC_SCALE", daq_adc_scale as TriggerFn),
            ("MAX31855K_THERMOCOUPLE", max31855k_thermocouple as TriggerFn),
            ("PCB1403_CURRENT_EXCITE", pcb1403_current_excite as TriggerFn),
            ("PRESSURE_TRANSDUCER_8252", pressure_transducer_8252 as TriggerFn),
            ("SOLENOID_STATE_TO_STR", solenoid_state_to_str as TriggerFn),
            ("IGNITER_STATE_TO_STR", igniter_state_to_str as TriggerFn),
            ("MODE_STATE_TO_STR", mode_state_to_str as TriggerFn),
            ("SAFE_STATE_TO_STR", safe_state_to_str as TriggerFn),
        ]
    })
}

pub fn lookup(name: &str) -> Option<TriggerFn> {
    registry().iter().find(|(n, _)| *n == name).map(|(_, f)| *f)
}

/// First arg is source, second is destination: copy source's bytes to
/// destination verbatim.
fn copy(tv: &Viewer, tw: &mut Writer, args: &[String]) -> TriggerOutcome {
    if args.len() != 2 {
        return TriggerOutcome::Failure;
    }
    let Some(raw) = tv.get_raw(&args[0]) else {
        return TriggerOutcome::Failure;
    };
    let raw = raw.to_vec();
    match tw.write_raw(&args[1], &raw) {
        Ok(()) => TriggerOutcome::Success,
        Err(_) => TriggerOutcome::Failure,
    }
}

/// First arg is the output; sums all remaining args and writes the total.
fn sum_uint(tv: &Viewer, tw: &mut Writer, args: &[String]) -> TriggerOutcome {
    if args.len() < 2 {
        return TriggerOutcome::Failure;
    }
    let mut total: u64 = 0;
    for name in &args[1..] {
        match tv.get_uint(name) {
            Some(v) => total = total.wrapping_add(v),
            None => return TriggerOutcome::Failure,
        }
    }
    write_uint(tw, &args[0], total)
}

/// Welford's method over the last 20 samples. `arg1` is the newest sample,
/// `arg2` is the running mean (both read back and re-written every cycle).
fn rolling_avg_double_20(tv: &Viewer, tw: &mut Writer, args: &[String]) -> TriggerOutcome {
    const WINDOW: f64 = 20.0;
    if args.len() != 2 {
        return TriggerOutcome::Failure;
    }
    let Some(sample) = tv.get_float(&args[0]) else {
        return TriggerOutcome::Failure;
    };
    let prev_mean = read_prev_float(tw, &args[1]).unwrap_or(sample);
    let new_mean = prev_mean + (sample - prev_mean) / WINDOW;
    write_float(tw, &args[1], new_mean)
}

fn max_double(tv: &Viewer, tw: &mut Writer, args: &[String]) -> TriggerOutcome {
    extremum(tv, tw, args, f64::max)
}

fn min_double(tv: &Viewer, tw: &mut Writer, args: &[String]) -> TriggerOutcome {
    extremum(tv, tw, args, f64::min)
}

/// Only writes (and reports `Success`) when `sample` actually moves the
/// extremum; otherwise reports `NoChange` without touching the virtual
/// packet, matching `basic.cpp`'s `MAX_DOUBLE`/`MIN_DOUBLE` (`NOCHANGE`
/// unless `x > max` / `x < max`) and §4.7's "only 'success' arms the
/// flush."
fn extremum(tv: &Viewer, tw: &mut Writer, args: &[String], combine: fn(f64, f64) -> f64) -> TriggerOutcome {
    if args.len() != 2 {
        return TriggerOutcome::Failure;
    }
    let Some(sample) = tv.get_float(&args[0]) else {
        return TriggerOutcome::Failure;
    };
    let prev = read_prev_float(tw, &args[1]).unwrap_or(sample);
    let new_extremum = combine(prev, sample);
    if new_extremum == prev {
        return TriggerOutcome::NoChange;
    }
    write_float(tw, &args[1], new_extremum)
}

/// Linear scale of a raw ADC count (12-bit, 0-4095) against a 5V reference.
/// `arg1` is the raw count, `arg2` is the output volts.
fn daq_adc_scale(tv: &Viewer, tw: &mut Writer, args: &[String]) -> TriggerOutcome {
    const ADC_MAX_COUNT: f64 = 4095.0;
    const ADC_REF_VOLTS: f64 = 5.0;
    if args.len() != 2 {
        return TriggerOutcome::Failure;
    }
    let Some(raw) = tv.get_uint(&args[0]) else {
        return TriggerOutcome::Failure;
    };
    let volts = (raw as f64 / ADC_MAX_COUNT) * ADC_REF_VOLTS;
    write_float(tw, &args[1], volts)
}

/// MAX31855K thermocouple amplifier: the thermocouple temperature occupies
/// the top 14 bits of the 32-bit frame in 0.25 degC steps, signed.
fn max31855k_thermocouple(tv: &Viewer, tw: &mut Writer, args: &[String]) -> TriggerOutcome {
    if args.len() != 2 {
        return TriggerOutcome::Failure;
    }
    let Some(raw) = tv.get_int(&args[0]) else {
        return TriggerOutcome::Failure;
    };
    let signed14 = raw >> 18;
    let temp_c = signed14 as f64 * 0.25;
    write_float(tw, &args[1], temp_c)
}

/// PCB Piezotronics 1403-series current-excited sensor: linear scale by a
/// fixed sensitivity (mV/engineering-unit).
fn pcb1403_current_excite(tv: &Viewer, tw: &mut Writer, args: &[String]) -> TriggerOutcome {
    const SENSITIVITY_MV_PER_UNIT: f64 = 100.0;
    if args.len() != 2 {
        return TriggerOutcome::Failure;
    }
    let Some(raw_volts) = tv.get_float(&args[0]) else {
        return TriggerOutcome::Failure;
    };
    let units = (raw_volts * 1000.0) / SENSITIVITY_MV_PER_UNIT;
    write_float(tw, &args[1], units)
}

/// Honeywell 8252-series pressure transducer: linear 0.5V-4.5V maps to
/// 0-`FULL_SCALE_PSI`.
fn pressure_transducer_8252(tv: &Viewer, tw: &mut Writer, args: &[String]) -> TriggerOutcome {
    const FULL_SCALE_PSI: f64 = 5000.0;
    const V_MIN: f64 = 0.5;
    const V_MAX: f64 = 4.5;
    if args.len() != 2 {
        return TriggerOutcome::Failure;
    }
    let Some(raw_volts) = tv.get_float(&args[0]) else {
        return TriggerOutcome::Failure;
    };
    let clamped = raw_volts.clamp(V_MIN, V_MAX);
    let psi = (clamped - V_MIN) / (V_MAX - V_MIN) * FULL_SCALE_PSI;
    write_float(tw, &args[1], psi)
}

fn solenoid_state_to_str(tv: &Viewer, tw: &mut Writer, args: &[String]) -> TriggerOutcome {
    state_to_str(tv, tw, args, |s| match s {
        0 => "CLOSED",
        1 => "OPEN",
        2 => "FAULT",
        _ => "UNKNOWN",
    })
}

fn igniter_state_to_str(tv: &Viewer, tw: &mut Writer, args: &[String]) -> TriggerOutcome {
    state_to_str(tv, tw, args, |s| match s {
        0 => "IDLE",
        1 => "ARMED",
        2 => "FIRING",
        3 => "FIRED",
        4 => "FAULT",
        _ => "UNKNOWN",
    })
}

fn mode_state_to_str(tv: &Viewer, tw: &mut Writer, args: &[String]) -> TriggerOutcome {
    state_to_str(tv, tw, args, |s| match s {
        0 => "STANDBY",
        1 => "PRELAUNCH",
        2 => "LAUNCH",
        3 => "ABORT",
        4 => "POSTLAUNCH",
        _ => "UNKNOWN",
    })
}

fn safe_state_to_str(tv: &Viewer, tw: &mut Writer, args: &[String]) -> TriggerOutcome {
    state_to_str(tv, tw, args, |s| match s {
        0 => "SAFE",
        1 => "ARMED",
        _ => "UNKNOWN",
    })
}

fn state_to_str(tv: &Viewer, tw: &mut Writer, args: &[String], decode: fn(i64) -> &'static str) -> TriggerOutcome {
    if args.len() != 2 {
        return TriggerOutcome::Failure;
    }
    let Some(state) = tv.get_int(&args[0]) else {
        return TriggerOutcome::Failure;
    };
    let s = decode(state);
    match tw.write_value(&args[1], crate::convert::Value::Str(s.to_string())) {
        Ok(()) => TriggerOutcome::Success,
        Err(_) => TriggerOutcome::Failure,
    }
}

fn read_prev_float(tw: &Writer, name: &str) -> Option<f64> {
    match tw.read_staged(name)? {
        crate::convert::Value::Float(v) => Some(v),
        _ => None,
    }
}

fn write_float(tw: &mut Writer, name: &str, value: f64) -> TriggerOutcome {
    match tw.write_value(name, crate::convert::Value::Float(value)) {
        Ok(()) => TriggerOutcome::Success,
        Err(_) => TriggerOutcome::Failure,
    }
}

fn write_uint(tw: &mut Writer, name: &str, value: u64) -> TriggerOutcome {
    match tw.write_value(name, crate::convert::Value::UInt(value)) {
        Ok(()) => TriggerOutcome::Success,
        Err(_) => TriggerOutcome::Failure,
    }
}
