fn main() {
    if let Err(err) = amafix::cli::run() {
        amafix::ui::eprintln_error(&err);
        std::process::exit(amafix::exit::exit_code(&err));
    }
}
