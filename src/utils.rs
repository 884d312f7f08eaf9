/// Switches the console to UTF-8 output with VT escape processing, which the
/// terminal panel needs for its box drawing and the ▲/▼ glyphs. Returns
/// whether the console accepted it.
#[cfg(windows)]
pub fn enable_panel_console() -> bool {
    use windows_sys::Win32::System::Console::{
        GetConsoleMode, GetStdHandle, SetConsoleMode, SetConsoleOutputCP,
        ENABLE_VIRTUAL_TERMINAL_PROCESSING, STD_OUTPUT_HANDLE,
    };
    const CP_UTF8: u32 = 65001;

    // SAFETY: console calls on this process's own stdout handle; `mode` outlives the call.
    unsafe {
        let utf8 = SetConsoleOutputCP(CP_UTF8) != 0;
        let stdout = GetStdHandle(STD_OUTPUT_HANDLE);
        let mut mode = 0;
        utf8 && GetConsoleMode(stdout, &mut mode) != 0
            && SetConsoleMode(stdout, mode | ENABLE_VIRTUAL_TERMINAL_PROCESSING) != 0
    }
}

#[cfg(not(windows))]
pub fn enable_panel_console() -> bool {
    true
}

/// Truncates or right-pads `text` to exactly `width` characters.
pub fn fit_line(text: &str, width: usize) -> String {
    let mut line: String = text.chars().take(width).collect();
    let len = line.chars().count();
    line.extend(std::iter::repeat(' ').take(width - len));
    line
}
