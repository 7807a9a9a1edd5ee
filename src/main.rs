fn main() {
    if let Err(e) = session_monitor::run() {
        eprintln!("session-monitor: {}", e);
        std::process::exit(1);
    }
}
