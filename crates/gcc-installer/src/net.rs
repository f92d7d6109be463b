use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use crate::error::{Error, Result};

/// How a URL is checked for existence and fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Http,
    Ftp,
}

impl TransportKind {
    /// `None` for schemes we cannot validate; such URLs are never selected.
    pub fn from_url(url: &str) -> Option<Self> {
        let (scheme, _) = url.split_once("://")?;
        match scheme.to_ascii_lowercase().as_str() {
            "http" | "https" => Some(Self::Http),
            "ftp" => Some(Self::Ftp),
            _ => None,
        }
    }
}

pub trait Transport: Send + Sync {
    /// Whether the remote object exists.
    fn probe(&self, kind: TransportKind, url: &str) -> Result<bool>;
    fn download(&self, kind: TransportKind, url: &str, dest: &Path) -> Result<()>;
}

/// HTTP(S) through reqwest, FTP through `wget`.
pub struct NetTransport {
    probe_client: reqwest::blocking::Client,
    download_client: reqwest::blocking::Client,
}

impl NetTransport {
    pub fn new() -> Result<Self> {
        let probe_client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::msg(format!("failed to build HTTP client: {e}")))?;
        // Compiler tarballs are large; never time out a running transfer.
        let download_client = reqwest::blocking::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .timeout(None::<Duration>)
            .build()
            .map_err(|e| Error::msg(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            probe_client,
            download_client,
        })
    }

    fn probe_http(&self, url: &str) -> Result<bool> {
        let res = self
            .probe_client
            .head(url)
            .send()
            .map_err(|e| Error::msg(format!("HTTP probe failed: {e}")))?;
        tracing::debug!(%url, status = %res.status(), "http probe");
        Ok(res.status() == reqwest::StatusCode::OK)
    }

    fn probe_ftp(&self, url: &str) -> Result<bool> {
        let out = Command::new("wget")
            .arg("--spider")
            .arg(url)
            .env("LC_ALL", "C")
            .output()
            .map_err(|e| Error::msg(format!("failed to run wget --spider: {e}")))?;
        let mut text = String::from_utf8_lossy(&out.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&out.stderr));
        tracing::debug!(%url, status = %out.status, "ftp probe");
        Ok(ftp_probe_found(out.status.success(), &text))
    }

    fn download_http(&self, url: &str, part: &Path) -> Result<()> {
        let mut res = self
            .download_client
            .get(url)
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(|e| Error::msg(format!("HTTP download failed: {e}")))?;
        let mut file = fs::File::create(part)
            .map_err(|e| Error::msg(format!("failed to create {}: {e}", part.display())))?;
        let bytes = res
            .copy_to(&mut file)
            .map_err(|e| Error::msg(format!("HTTP download of {url} interrupted: {e}")))?;
        file.sync_all()?;
        tracing::info!(%url, bytes, "download complete");
        Ok(())
    }

    fn download_ftp(&self, url: &str, part: &Path) -> Result<()> {
        let status = Command::new("wget")
            .arg("--quiet")
            .arg("--output-document")
            .arg(part)
            .arg(url)
            .status()
            .map_err(|e| Error::msg(format!("failed to run wget: {e}")))?;
        if !status.success() {
            return Err(Error::msg(format!("FTP download of {url} failed: {status}")));
        }
        Ok(())
    }
}

impl Transport for NetTransport {
    fn probe(&self, kind: TransportKind, url: &str) -> Result<bool> {
        match kind {
            TransportKind::Http => self.probe_http(url),
            TransportKind::Ftp => self.probe_ftp(url),
        }
    }

    fn download(&self, kind: TransportKind, url: &str, dest: &Path) -> Result<()> {
        let part = part_path(dest);
        let res = match kind {
            TransportKind::Http => self.download_http(url, &part),
            TransportKind::Ftp => self.download_ftp(url, &part),
        };
        if let Err(e) = res {
            let _ = fs::remove_file(&part);
            return Err(e);
        }
        fs::rename(&part, dest).map_err(|e| {
            Error::msg(format!(
                "failed to move {} -> {}: {e}",
                part.display(),
                dest.display()
            ))
        })
    }
}

fn part_path(dest: &Path) -> PathBuf {
    let mut s = dest.as_os_str().to_os_string();
    s.push(".part");
    PathBuf::from(s)
}

// A clean `wget --spider` exit means the file exists unless the listing
// reports a miss; the "File ... exists." line counts on its own.
fn ftp_probe_found(success: bool, output: &str) -> bool {
    let missing = output
        .lines()
        .any(|l| l.trim_start().starts_with("No such file"));
    (success && !missing) || ftp_listing_says_exists(output)
}

// Messages are only stable under the C locale.
fn ftp_listing_says_exists(output: &str) -> bool {
    output
        .lines()
        .any(|l| l.trim_start().starts_with("File ") && l.trim_end().ends_with("exists."))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread::JoinHandle;

    fn local_transport() -> NetTransport {
        let client = || {
            reqwest::blocking::Client::builder()
                .no_proxy()
                .build()
                .expect("client")
        };
        NetTransport {
            probe_client: client(),
            download_client: client(),
        }
    }

    // One canned response per connection, in order. Returns the request lines.
    fn serve(responses: Vec<Vec<u8>>) -> (String, JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let base = format!("http://{}", listener.local_addr().expect("addr"));
        let handle = std::thread::spawn(move || {
            let mut requests = Vec::new();
            for response in responses {
                let (mut stream, _) = listener.accept().expect("accept");
                let mut buf = Vec::new();
                let mut chunk = [0u8; 1024];
                while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
                    let n = stream.read(&mut chunk).expect("read");
                    if n == 0 {
                        break;
                    }
                    buf.extend_from_slice(&chunk[..n]);
                }
                let head = String::from_utf8_lossy(&buf).into_owned();
                requests.push(head.lines().next().unwrap_or_default().to_string());
                stream.write_all(&response).expect("write");
            }
            requests
        });
        (base, handle)
    }

    fn response(status: &str, content_length: usize, body: &[u8]) -> Vec<u8> {
        let mut out = format!(
            "HTTP/1.1 {status}\r\nContent-Length: {content_length}\r\nConnection: close\r\n\r\n"
        )
        .into_bytes();
        out.extend_from_slice(body);
        out
    }

    #[test]
    fn http_probe_accepts_only_200() {
        let (base, server) = serve(vec![
            response("200 OK", 0, b""),
            response("404 Not Found", 0, b""),
            response("204 No Content", 0, b""),
        ]);
        let t = local_transport();
        let url = format!("{base}/gcc-8.2.0.tar.xz");

        assert!(t.probe(TransportKind::Http, &url).expect("probe 200"));
        assert!(!t.probe(TransportKind::Http, &url).expect("probe 404"));
        assert!(!t.probe(TransportKind::Http, &url).expect("probe 204"));

        let requests = server.join().expect("server");
        assert_eq!(requests.len(), 3);
        assert!(
            requests
                .iter()
                .all(|r| r.starts_with("HEAD /gcc-8.2.0.tar.xz "))
        );
    }

    #[test]
    fn http_download_renames_part_file_on_success() {
        let (base, server) = serve(vec![response("200 OK", 8, b"xz-bytes")]);
        let tmp = tempfile::tempdir().expect("tempdir");
        let dest = tmp.path().join("gcc-8.2.0.tar.xz");

        local_transport()
            .download(TransportKind::Http, &format!("{base}/gcc-8.2.0.tar.xz"), &dest)
            .expect("download");
        server.join().expect("server");

        assert_eq!(fs::read(&dest).expect("archive"), b"xz-bytes");
        assert!(!part_path(&dest).exists());
    }

    #[test]
    fn failed_http_download_leaves_no_archive() {
        let (base, server) = serve(vec![
            response("500 Internal Server Error", 0, b""),
            // Connection closes long before the announced length.
            response("200 OK", 4096, b"truncated"),
        ]);
        let tmp = tempfile::tempdir().expect("tempdir");
        let dest = tmp.path().join("gcc-8.2.0.tar.xz");
        let url = format!("{base}/gcc-8.2.0.tar.xz");
        let t = local_transport();

        assert!(t.download(TransportKind::Http, &url, &dest).is_err());
        assert!(t.download(TransportKind::Http, &url, &dest).is_err());
        server.join().expect("server");

        let left: Vec<_> = fs::read_dir(tmp.path())
            .expect("read_dir")
            .map(|e| e.expect("entry").file_name())
            .collect();
        assert!(left.is_empty(), "unexpected files: {left:?}");
    }

    #[test]
    fn classifies_url_schemes() {
        assert_eq!(
            TransportKind::from_url("https://ftpmirror.gnu.org/gcc/x.tar.xz"),
            Some(TransportKind::Http)
        );
        assert_eq!(
            TransportKind::from_url("HTTP://mirror/x.tar.gz"),
            Some(TransportKind::Http)
        );
        assert_eq!(
            TransportKind::from_url("ftp://ftp.gnu.org/gnu/gcc/x.tar.bz2"),
            Some(TransportKind::Ftp)
        );
        assert_eq!(TransportKind::from_url("rsync://mirror/x.tar.xz"), None);
        assert_eq!(TransportKind::from_url("/local/x.tar.xz"), None);
    }

    #[test]
    fn reads_wget_spider_output() {
        let hit = "--2018-07-26-- ftp://ftp.gnu.org/gnu/gcc/gcc-8.2.0/gcc-8.2.0.tar.xz\n\
                   ==> SIZE gcc-8.2.0.tar.xz ... 63460876\n\
                   File ‘gcc-8.2.0.tar.xz’ exists.\n";
        let miss = "==> SIZE gcc-8.2.0.tar.lz ... done.\nNo such file ‘gcc-8.2.0.tar.lz’.\n";
        assert!(ftp_listing_says_exists(hit));
        assert!(!ftp_listing_says_exists(miss));
    }

    #[test]
    fn ftp_probe_trusts_exit_status_over_localized_text() {
        let german = "==> SIZE gcc-8.2.0.tar.xz ... 63460876
Datei »gcc-8.2.0.tar.xz« existiert.
";
        assert!(ftp_probe_found(true, german));
        assert!(!ftp_probe_found(false, german));
        assert!(!ftp_probe_found(true, "No such file ‘gcc-8.2.0.tar.lz’.
"));
        assert!(ftp_probe_found(false, "File ‘gcc-8.2.0.tar.xz’ exists.
"));
    }

    #[test]
    fn part_file_sits_next_to_destination() {
        assert_eq!(
            part_path(Path::new("/ws/archive/gcc-8.2.0.tar.xz")),
            PathBuf::from("/ws/archive/gcc-8.2.0.tar.xz.part")
        );
    }
}
