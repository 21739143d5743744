fn main() {
    match runbox::cli::run() {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(runbox::cli::error_exit_code(&e));
        }
    }
}
