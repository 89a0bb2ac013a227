use std::env;

fn main() {
    // Only the Ruby binding needs the C helpers (and Ruby's headers).
    if env::var_os("CARGO_FEATURE_RUBY").is_none() {
        return;
    }
    println!("cargo:rerun-if-changed=src/ruby_c_api_helper.c");
    cc::Build::new()
        .flag(format!("-I{}", env::var("DEP_RB_RBCONFIG_RUBYHDRDIR").unwrap()).as_str())
        .flag(format!("-I{}", env::var("DEP_RB_RBCONFIG_RUBYARCHHDRDIR").unwrap()).as_str())
        .file("src/ruby_c_api_helper.c")
        .compile("rubyhelper");
}
