use std::io::Write;
use std::process::ExitCode;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

// Usage: subject [loops] [exit_code]
// Prints loops - 1 heartbeats, sleeping i * 3 seconds after the i-th one,
// then announces and exits with exit_code. Times are UTC.

fn timestamp() -> String {
    let since_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let secs = since_epoch.as_secs();
    let millis = since_epoch.subsec_millis();
    let (year, month, day) = civil_from_days((secs / 86_400) as i64);
    let secs_of_day = secs % 86_400;

    format!(
        "{:02}:{:02}:{:02}.{:03} {:02}-{:02}-{:04}",
        secs_of_day / 3600,
        secs_of_day / 60 % 60,
        secs_of_day % 60,
        millis,
        day,
        month,
        year
    )
}

// Days since 1970-01-01 to (year, month, day), proleptic Gregorian.
fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
    let year = yoe + era * 400 + if month <= 2 { 1 } else { 0 };
    (year, month, day)
}

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();
    let mut loops: u32 = 5;
    let mut exit_code: i32 = 0;

    if args.len() == 1 {
        println!("This is a basic test application.");
        println!("It prints the date and time and then sleeps for loopCount * 3");
        println!("This program takes in two inputs, a loop count and an exit code");
        println!("By default it will run {} loops and exit with exit status {}", loops, exit_code);
    }
    if let Some(raw) = args.get(1) {
        loops = raw.parse().unwrap_or(loops);
        println!("Will run for requested {} loops", loops);
    }
    if let Some(raw) = args.get(2) {
        exit_code = raw.parse().unwrap_or(exit_code);
        println!("Will exit with supplied exit code {}", exit_code);
    }

    let mut stdout = std::io::stdout();
    for i in 1..loops {
        let _ = writeln!(
            stdout,
            "{} TEST APPLICIATION SLEEPING FOR {} SECONDS",
            timestamp(),
            i * 3
        );
        let _ = stdout.flush();
        thread::sleep(Duration::from_secs(u64::from(i) * 3));
    }

    println!("EXITING TEST APPLICICATION WITH EXIT CODE = {}", exit_code);
    ExitCode::from(exit_code as u8)
}
