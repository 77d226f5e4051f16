use time::macros::format_description;
use time::OffsetDateTime;

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    // Build date (UTC ISO-8601). Fallback to unix:<secs> if formatting fails.
    let now = OffsetDateTime::now_utc();
    let build_date = now
        .format(format_description!(
            "[year]-[month]-[day]T[hour]:[minute]:[second]Z"
        ))
        .unwrap_or_else(|_| format!("unix:{}", now.unix_timestamp()));
    println!("cargo:rustc-env=CCS_BUILD_DATE={build_date}");

    let target = std::env::var("TARGET").unwrap_or_else(|_| "unknown".to_string());
    println!("cargo:rustc-env=CCS_BUILD_TARGET={target}");

    let profile = std::env::var("PROFILE").unwrap_or_else(|_| "unknown".to_string());
    println!("cargo:rustc-env=CCS_BUILD_PROFILE={profile}");

    // rustc version (best-effort)
    let rustc_ver = rustc_version::version()
        .map(|v| v.to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    println!("cargo:rustc-env=CCS_BUILD_RUSTC={rustc_ver}");
}
