pub mod sys {
    use std::env;
    use tracing::error;

    const POD_HOSTNAME_ENV: &str = "RETRACE_POD_NAME";

    #[cfg(unix)]
    #[inline]
    pub fn hostname() -> String {
        env::var(POD_HOSTNAME_ENV).unwrap_or_else(|_e| {
            use libc::{c_char, sysconf, _SC_HOST_NAME_MAX};
            use std::os::unix::ffi::OsStringExt;
            // Get the maximum size of host names on this system, and account for the
            // trailing NUL byte.
            let hostname_max = unsafe { sysconf(_SC_HOST_NAME_MAX) };
            let mut buffer = vec![0; (hostname_max as usize) + 1];
            let status_code =
                unsafe { libc::gethostname(buffer.as_mut_ptr() as *mut c_char, buffer.len()) };
            if status_code != 0 {
                // There are no reasonable failures
                error!(
                    "Failed to get hostname {:?}",
                    std::io::Error::last_os_error()
                );
                "_NONE_HOSTNAME".to_string()
            } else {
                let end = buffer.iter().position(|&b| b == 0).unwrap_or(buffer.len());
                buffer.resize(end, 0);
                let hostname_os_string = std::ffi::OsString::from_vec(buffer);
                hostname_os_string.into_string().unwrap()
            }
        })
    }

    #[cfg(not(unix))]
    #[inline]
    pub fn hostname() -> String {
        env::var(POD_HOSTNAME_ENV).unwrap_or_else(|_| "_NONE_HOSTNAME".to_string())
    }
}
