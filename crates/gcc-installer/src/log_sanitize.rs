// Build tools happily emit colors, progress bars and cursor movement. Task
// logs end up both on the terminal and in plain-text failure logs, so strip
// escape sequences and control characters and cap the line length.

const MAX_LOG_CHARS: usize = 4096;

#[derive(Clone, Copy)]
enum Escape {
    Start,
    Csi,
    // OSC/DCS style strings end with BEL or ESC '\'.
    Str { saw_esc: bool },
}

pub fn sanitize_log_line(input: &str) -> String {
    let mut out = String::with_capacity(input.len().min(MAX_LOG_CHARS));
    let mut esc: Option<Escape> = None;
    let mut kept = 0usize;

    for c in input.chars() {
        if let Some(state) = esc {
            esc = match (state, c) {
                (Escape::Start, '[') => Some(Escape::Csi),
                (Escape::Start, ']' | 'P' | 'X' | '^' | '_') => {
                    Some(Escape::Str { saw_esc: false })
                }
                (Escape::Start, _) => None,
                (Escape::Csi, '@'..='~') => None,
                (Escape::Csi, _) => Some(Escape::Csi),
                (Escape::Str { .. }, '\x07') => None,
                (Escape::Str { saw_esc: true }, '\\') => None,
                (Escape::Str { .. }, '\x1b') => Some(Escape::Str { saw_esc: true }),
                (Escape::Str { .. }, _) => Some(Escape::Str { saw_esc: false }),
            };
            continue;
        }

        match c {
            '\x1b' => esc = Some(Escape::Start),
            '\t' => {
                out.push(' ');
                kept += 1;
            }
            c if c.is_control() => {}
            c => {
                out.push(c);
                kept += 1;
            }
        }

        if kept >= MAX_LOG_CHARS {
            out.push_str(" …[truncated]");
            break;
        }
    }

    out.trim_end().to_string()
}
