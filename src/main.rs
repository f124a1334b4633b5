fn main() {
    if let Err(e) = arya_lib::run() {
        eprintln!("arya: {e}");
        std::process::exit(1);
    }
}
