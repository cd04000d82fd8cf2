//! Scoped timing measurements, written out as Chrome trace events.
//! Off by default; enabled by open(), typically behind a debug flag.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::sync::Mutex;
use std::time::Instant;

static TRACE: Mutex<Option<Trace>> = Mutex::new(None);

struct Trace {
    start: Instant,
    w: BufWriter<File>,
}

impl Trace {
    fn new(path: &str) -> std::io::Result<Self> {
        let mut w = BufWriter::new(File::create(path)?);
        writeln!(w, "[")?;
        Ok(Trace {
            start: Instant::now(),
            w,
        })
    }

    fn write_complete(&mut self, name: &str, start: Instant, end: Instant) -> std::io::Result<()> {
        writeln!(
            self.w,
            "{{ \"pid\": 0, \"name\": {:?}, \"ts\": {}, \"ph\": \"X\", \"dur\": {} }},",
            name,
            start.duration_since(self.start).as_micros(),
            end.duration_since(start).as_micros(),
        )
    }

    fn close(&mut self) -> std::io::Result<()> {
        let start = self.start;
        self.write_complete("main", start, Instant::now())?;
        writeln!(self.w, "]")?;
        self.w.flush()
    }
}

pub fn open(path: &str) -> std::io::Result<()> {
    let trace = Trace::new(path)?;
    *TRACE.lock().unwrap() = Some(trace);
    Ok(())
}

/// Time a region of code, attributing it to the given name in the trace.
/// When no trace is open this is just a call to f.
pub fn scope<T>(name: &str, f: impl FnOnce() -> T) -> T {
    let start = Instant::now();
    let result = f();
    if let Some(t) = TRACE.lock().unwrap().as_mut() {
        // Trace output is best-effort; write failures surface at close().
        let _ = t.write_complete(name, start, Instant::now());
    }
    result
}

pub fn close() -> std::io::Result<()> {
    if let Some(t) = TRACE.lock().unwrap().as_mut() {
        return t.close();
    }
    Ok(())
}
