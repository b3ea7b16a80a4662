/// ASCII banner shown at the top of the status output.
pub fn banner() -> String {
    format!(
        r#"
 _   _                     _       _
| |_(_)_ __ ___   ___  ___(_)_ __ | | __
| __| | '_ ` _ \ / _ \/ __| | '_ \| |/ /
| |_| | | | | | |  __/\__ \ | | | |   <
 \__|_|_| |_| |_|\___||___/_|_| |_|_|\_\  v{version}
"#,
        version = env!("CARGO_PKG_VERSION")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn banner_carries_the_version() {
        assert!(banner().contains(env!("CARGO_PKG_VERSION")));
    }
}
