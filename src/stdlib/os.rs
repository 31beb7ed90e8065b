use super::{register_module, set_fn};
use crate::errors::RuntimeError;
use crate::state::State;
use crate::table::Table;
use crate::value::Value;
use std::rc::Rc;
use std::time::{SystemTime, UNIX_EPOCH};

pub fn open_os(l: &Rc<State>) {
    let module = register_module(l, "os");

    let start = std::time::Instant::now();
    set_fn(l, &module, "clock", move |l| {
        l.push(Value::Number(start.elapsed().as_secs_f64()));
        Ok(1)
    });
    set_fn(l, &module, "time", os_time);
    set_fn(l, &module, "difftime", os_difftime);
    set_fn(l, &module, "date", os_date);
    set_fn(l, &module, "getenv", os_getenv);
}

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

fn os_time(l: &Rc<State>) -> Result<i32, RuntimeError> {
    if let Some(t) = l.to_table(1) {
        let get = |key: &str, default: i64| -> i64 {
            match t.raw_get_string(key) {
                Value::Number(n) => n as i64,
                _ => default,
            }
        };
        let civil = CivilTime {
            year: get("year", 1970),
            month: get("month", 1),
            day: get("day", 1),
            hour: get("hour", 12),
            min: get("min", 0),
            sec: get("sec", 0),
        };
        l.push(Value::Number(civil.to_unix() as f64));
    } else {
        l.push(Value::Number(unix_now().floor()));
    }
    Ok(1)
}

fn os_difftime(l: &Rc<State>) -> Result<i32, RuntimeError> {
    let t2 = l.check_number(1)?;
    let t1 = l.opt_number(2, 0.0)?;
    l.push(Value::Number(t2 - t1));
    Ok(1)
}

fn os_getenv(l: &Rc<State>) -> Result<i32, RuntimeError> {
    let name = l.check_string(1)?;
    match std::env::var(name.to_string_lossy().as_ref()) {
        Ok(value) => l.push(Value::string(value)),
        Err(_) => l.push(Value::Nil),
    }
    Ok(1)
}

/// UTC-only `os.date`: `*t`/`!*t` produce the field table, everything
/// else goes through a strftime-like formatter.
fn os_date(l: &Rc<State>) -> Result<i32, RuntimeError> {
    let format = l.opt_string(1, "%c")?;
    let time = l.opt_number(2, unix_now())? as i64;
    let civil = CivilTime::from_unix(time);

    let text = format.to_string_lossy().into_owned();
    let spec = text.trim_start_matches('!');
    if spec == "*t" {
        let t = Table::with_capacity(0, 8).wrap();
        t.raw_set_string("year", Value::Number(civil.year as f64));
        t.raw_set_string("month", Value::Number(civil.month as f64));
        t.raw_set_string("day", Value::Number(civil.day as f64));
        t.raw_set_string("hour", Value::Number(civil.hour as f64));
        t.raw_set_string("min", Value::Number(civil.min as f64));
        t.raw_set_string("sec", Value::Number(civil.sec as f64));
        t.raw_set_string("wday", Value::Number((civil.weekday() + 1) as f64));
        t.raw_set_string("isdst", Value::Bool(false));
        l.push(Value::Table(t));
    } else {
        l.push(Value::string(civil.format(spec)));
    }
    Ok(1)
}

struct CivilTime {
    year: i64,
    month: i64,
    day: i64,
    hour: i64,
    min: i64,
    sec: i64,
}

impl CivilTime {
    // days-from-civil / civil-from-days, the standard proleptic
    // Gregorian conversion
    fn from_unix(time: i64) -> CivilTime {
        let days = time.div_euclid(86400);
        let secs = time.rem_euclid(86400);
        let z = days + 719468;
        let era = z.div_euclid(146097);
        let doe = z.rem_euclid(146097);
        let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
        let y = yoe + era * 400;
        let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
        let mp = (5 * doy + 2) / 153;
        let d = doy - (153 * mp + 2) / 5 + 1;
        let m = if mp < 10 { mp + 3 } else { mp - 9 };
        CivilTime {
            year: if m <= 2 { y + 1 } else { y },
            month: m,
            day: d,
            hour: secs / 3600,
            min: (secs / 60) % 60,
            sec: secs % 60,
        }
    }

    fn to_unix(&self) -> i64 {
        let y = if self.month <= 2 {
            self.year - 1
        } else {
            self.year
        };
        let era = y.div_euclid(400);
        let yoe = y.rem_euclid(400);
        let mp = if self.month > 2 {
            self.month - 3
        } else {
            self.month + 9
        };
        let doy = (153 * mp + 2) / 5 + self.day - 1;
        let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
        let days = era * 146097 + doe - 719468;
        days * 86400 + self.hour * 3600 + self.min * 60 + self.sec
    }

    fn weekday(&self) -> i64 {
        let days = self.to_unix().div_euclid(86400);
        (days + 4).rem_euclid(7)
    }

    fn format(&self, spec: &str) -> String {
        const MONTHS: [&str; 12] = [
            "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
        ];
        const DAYS: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];

        let mut out = String::new();
        let mut chars = spec.chars();
        while let Some(c) = chars.next() {
            if c != '%' {
                out.push(c);
                continue;
            }
            match chars.next() {
                Some('Y') => out.push_str(&self.year.to_string()),
                Some('y') => out.push_str(&format!("{:02}", self.year % 100)),
                Some('m') => out.push_str(&format!("{:02}", self.month)),
                Some('d') => out.push_str(&format!("{:02}", self.day)),
                Some('H') => out.push_str(&format!("{:02}", self.hour)),
                Some('M') => out.push_str(&format!("{:02}", self.min)),
                Some('S') => out.push_str(&format!("{:02}", self.sec)),
                Some('b') => out.push_str(MONTHS[(self.month - 1) as usize % 12]),
                Some('a') => out.push_str(DAYS[self.weekday() as usize % 7]),
                Some('w') => out.push_str(&self.weekday().to_string()),
                Some('c') => out.push_str(&format!(
                    "{} {} {:2} {:02}:{:02}:{:02} {}",
                    DAYS[self.weekday() as usize % 7],
                    MONTHS[(self.month - 1) as usize % 12],
                    self.day,
                    self.hour,
                    self.min,
                    self.sec,
                    self.year
                )),
                Some('%') => out.push('%'),
                Some(other) => {
                    out.push('%');
                    out.push(other);
                }
                None => out.push('%'),
            }
        }
        out
    }
}
