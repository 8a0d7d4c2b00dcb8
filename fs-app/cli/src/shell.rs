//! Line-oriented shell: login loop, tokenizing, dispatch and rendering

use anyhow::{anyhow, bail, Context, Result};
use log::{debug, error, info, warn};
use std::io::{BufRead, Write};

use tinyext::{
    Access, FileSystem, FsError, HandleId, Inode, InodeKind, Mode, Session, MAX_PATH_LEN,
};

use crate::help::HELP;
use crate::users::UserTable;

/// What the command loop does after a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Logout,
    Quit,
}

pub struct Shell<R, W> {
    fs: FileSystem,
    users: UserTable,
    input: R,
    out: W,
}

impl<R: BufRead, W: Write> Shell<R, W> {
    pub fn new(fs: FileSystem, users: UserTable, input: R, out: W) -> Self {
        Self {
            fs,
            users,
            input,
            out,
        }
    }

    pub fn filesystem(&self) -> &FileSystem {
        &self.fs
    }

    /// Read one line; `None` at end of input
    fn read_line(&mut self) -> Result<Option<String>> {
        let mut line = String::new();
        let read = self
            .input
            .read_line(&mut line)
            .context("Failed to read input")?;
        if read == 0 {
            return Ok(None);
        }
        Ok(Some(line.trim().to_string()))
    }

    fn prompt(&mut self, text: &str) -> Result<Option<String>> {
        write!(self.out, "{}", text)?;
        self.out.flush()?;
        self.read_line()
    }

    /// Alternate between login and command loop until the user quits
    pub fn run(&mut self) -> Result<()> {
        while let Some(mut session) = self.login()? {
            let flow = self.command_loop(&mut session);
            let closed = self.fs.end_session(&session);
            if closed > 0 {
                info!("Closed {} handle(s) left open by '{}'", closed, session.user);
            }
            if flow? == Flow::Quit {
                writeln!(self.out, "Good Bye!")?;
                return Ok(());
            }
        }
        writeln!(self.out, "Good Bye!")?;
        Ok(())
    }

    fn login(&mut self) -> Result<Option<Session>> {
        loop {
            let name = match self.prompt("username: ")? {
                None => return Ok(None),
                Some(name) if name == "quit" || name == "exit" => return Ok(None),
                Some(name) if name.is_empty() => continue,
                Some(name) => name,
            };
            let password = match self.prompt("password: ")? {
                None => return Ok(None),
                Some(password) => password,
            };

            match self.users.authenticate(&name, &password) {
                Some(user) => {
                    let creds = user.credentials();
                    let session = self.fs.open_session(&name, creds);
                    writeln!(self.out, "Welcome, {}!", name)?;
                    return Ok(Some(session));
                }
                None => {
                    warn!("Failed login for '{}'", name);
                    writeln!(self.out, "Login incorrect")?;
                }
            }
        }
    }

    fn command_loop(&mut self, session: &mut Session) -> Result<Flow> {
        loop {
            let prompt = format!("[{}@tinyext {}]# ", session.user, session.display_path());
            let line = match self.prompt(&prompt)? {
                None => return Ok(Flow::Quit),
                Some(line) => line,
            };
            if line.is_empty() {
                continue;
            }

            let tokens: Vec<&str> = line.split_whitespace().collect();
            debug!("Command: {:?}", tokens);
            match self.execute(session, &tokens) {
                Ok(Flow::Continue) => {}
                Ok(flow) => return Ok(flow),
                Err(e) => {
                    if let Some(fs_err) = e.downcast_ref::<FsError>() {
                        if fs_err.is_fatal() {
                            error!("Disk failure: {}", fs_err);
                            return Err(e.context("Unrecoverable disk error"));
                        }
                    }
                    writeln!(self.out, "error: {:#}", e)?;
                }
            }
        }
    }

    fn execute(&mut self, session: &mut Session, tokens: &[&str]) -> Result<Flow> {
        let (command, args) = match tokens.split_first() {
            Some((command, args)) => (*command, args),
            None => return Ok(Flow::Continue),
        };

        match command {
            "cd" => self.fs.change_directory(session, arg(args, 0, "cd <path>")?)?,
            "pwd" => writeln!(self.out, "{}", session.display_path())?,
            "mkdir" => {
                let path = arg(args, 0, "mkdir <path> [mode]")?;
                let mode = optional_mode(args.get(1), Mode::DEFAULT_DIR)?;
                self.fs.make_directory(session, path, mode)?;
            }
            "touch" => {
                let path = arg(args, 0, "touch <path> [mode]")?;
                let mode = optional_mode(args.get(1), Mode::DEFAULT_FILE)?;
                self.fs.create_file(session, path, mode)?;
            }
            "rmdir" => self.fs.remove_directory(session, arg(args, 0, "rmdir <path>")?)?,
            "rm" => self.fs.remove(session, arg(args, 0, "rm <path>")?)?,
            "open" => {
                let path = arg(args, 0, "open <path> [r|w|rw]")?;
                let access = match args.get(1) {
                    Some(text) => text.parse::<Access>()?,
                    None => Access::ReadWrite,
                };
                let handle = self.fs.open_file(session, path, access)?;
                writeln!(self.out, "handle {}", handle)?;
            }
            "close" => self.close(session, arg(args, 0, "close <handle|path>")?)?,
            "read" => self.read(session, args)?,
            "write" => {
                let handle = handle_arg(args, "write <handle> <text...>")?;
                if args.len() < 2 {
                    bail!("usage: write <handle> <text...>");
                }
                let text = args[1..].join(" ");
                let written = self.fs.write_file(session, handle, text.as_bytes())?;
                writeln!(self.out, "wrote {} bytes", written)?;
            }
            "seek" => {
                let handle = handle_arg(args, "seek <handle> <offset>")?;
                let offset = arg(args, 1, "seek <handle> <offset>")?
                    .parse::<u64>()
                    .with_context(|| format!("invalid offset '{}'", args[1]))?;
                self.fs.seek(session, handle, offset)?;
            }
            "ls" => self.list(session, args)?,
            "stat" => {
                let inode = self.fs.stat(session, arg(args, 0, "stat <path>")?)?;
                self.print_stat(&inode)?;
            }
            "chmod" => {
                let path = arg(args, 0, "chmod <path> <mode>")?;
                let mode = Mode::parse_octal(arg(args, 1, "chmod <path> <mode>")?)?;
                self.fs.set_mode(session, path, mode)?;
            }
            "df" => self.disk_usage()?,
            "format" => self.format(session)?,
            "ckdisk" => self.check(args.first() == Some(&"--json"))?,
            "whoami" => writeln!(
                self.out,
                "{} (uid={}, gid={})",
                session.user, session.creds.uid, session.creds.gid
            )?,
            "help" | "h" => write!(self.out, "{}", HELP)?,
            "logout" => return Ok(Flow::Logout),
            "quit" | "exit" => return Ok(Flow::Quit),
            other => {
                writeln!(self.out, "Unknown command '{}', please check!", other)?;
                write!(self.out, "{}", HELP)?;
            }
        }
        Ok(Flow::Continue)
    }

    /// A number names a handle, anything else a path
    fn close(&mut self, session: &Session, target: &str) -> Result<()> {
        if let Ok(id) = target.parse::<u64>() {
            self.fs.close_file(session, HandleId(id))?;
            return Ok(());
        }
        let closed = self.fs.close_path(session, target)?;
        writeln!(self.out, "closed {} handle(s)", closed)?;
        Ok(())
    }

    fn read(&mut self, session: &Session, args: &[&str]) -> Result<()> {
        let handle = handle_arg(args, "read <handle> [len]")?;
        let len = match args.get(1) {
            Some(text) => text
                .parse::<usize>()
                .with_context(|| format!("invalid length '{}'", text))?,
            None => {
                // Everything from the cursor to the end of the file
                let open = self.fs.handles().get(handle).ok_or(FsError::NotFound)?;
                let inode = self.fs.inodes().get(open.inode)?;
                inode.size.saturating_sub(open.offset) as usize
            }
        };
        let data = self.fs.read_file(session, handle, len)?;
        writeln!(self.out, "{}", String::from_utf8_lossy(&data))?;
        Ok(())
    }

    fn list(&mut self, session: &Session, args: &[&str]) -> Result<()> {
        let long = args.first() == Some(&"-l");
        let rest = if long { &args[1..] } else { args };
        let path = rest.first().copied().unwrap_or(".");

        let entries = self.fs.list_path(session, path)?;
        for entry in entries {
            if !long {
                let suffix = if entry.kind == InodeKind::Directory { "/" } else { "" };
                writeln!(self.out, "{}{}", entry.name, suffix)?;
                continue;
            }
            let inode = self.fs.inodes().get(entry.inode)?;
            let kind = if inode.is_dir() { 'd' } else { '-' };
            writeln!(
                self.out,
                "{}{} {:>3} {:>5} {:>5} {:>8} {} {}",
                kind,
                inode.mode,
                inode.links,
                inode.uid,
                inode.gid,
                inode.size,
                timestamp(inode.modified),
                entry.name
            )?;
        }
        Ok(())
    }

    fn print_stat(&mut self, inode: &Inode) -> Result<()> {
        let block_size = self.fs.inodes().layout().block_size;
        let kind = match inode.kind {
            InodeKind::File => "regular file",
            InodeKind::Directory => "directory",
        };
        writeln!(self.out, "  Inode: {}  Type: {}", inode.id, kind)?;
        writeln!(self.out, "   Mode: {:04o} ({})", inode.mode, inode.mode)?;
        writeln!(self.out, "  Owner: uid={} gid={}", inode.uid, inode.gid)?;
        writeln!(self.out, "  Links: {}", inode.links)?;
        writeln!(
            self.out,
            "   Size: {}  Blocks: {}",
            inode.size,
            inode.block_count(block_size)
        )?;
        writeln!(self.out, "Created: {}", timestamp(inode.created))?;
        writeln!(self.out, "Changed: {}", timestamp(inode.modified))?;
        Ok(())
    }

    fn disk_usage(&mut self) -> Result<()> {
        let stats = self.fs.statfs();
        let used = stats.total_blocks - stats.free_blocks;
        writeln!(
            self.out,
            "Volume '{}': {} blocks of {} bytes",
            stats.volume_name, stats.total_blocks, stats.block_size
        )?;
        writeln!(
            self.out,
            "  Blocks: {} used ({} metadata), {} free",
            used, stats.metadata_blocks, stats.free_blocks
        )?;
        writeln!(
            self.out,
            "  Inodes: {} used, {} free",
            stats.total_inodes - stats.free_inodes,
            stats.free_inodes
        )?;
        Ok(())
    }

    fn format(&mut self, session: &mut Session) -> Result<()> {
        let answer = self.prompt("Format the disk? All data will be lost (y/n): ")?;
        match answer.as_deref() {
            Some("y") | Some("Y") => {
                writeln!(self.out, "Formatting...")?;
                self.fs.format_disk(session)?;
                writeln!(self.out, "Format complete")?;
            }
            _ => writeln!(self.out, "Format Disk canceled")?,
        }
        Ok(())
    }

    fn check(&mut self, json: bool) -> Result<()> {
        let report = self.fs.check_disk()?;
        if json {
            writeln!(self.out, "{}", serde_json::to_string_pretty(&report)?)?;
            return Ok(());
        }

        writeln!(self.out, "Checking disk...")?;
        writeln!(
            self.out,
            "  {} inodes in use ({} directories, {} files), {} blocks in use",
            report.inodes_in_use, report.directories, report.files, report.blocks_in_use
        )?;
        for violation in &report.violations {
            writeln!(self.out, "  {}", violation)?;
        }
        if !report.pending_delete.is_empty() {
            writeln!(
                self.out,
                "  {} unlinked inode(s) still open: {:?}",
                report.pending_delete.len(),
                report.pending_delete
            )?;
        }
        if report.is_clean() {
            writeln!(self.out, "Disk is consistent")?;
        } else {
            writeln!(self.out, "{} problem(s) found", report.violations.len())?;
        }
        Ok(())
    }
}

fn arg<'a>(args: &[&'a str], index: usize, usage: &str) -> Result<&'a str> {
    let value = args
        .get(index)
        .copied()
        .ok_or_else(|| anyhow!("usage: {}", usage))?;
    if value.len() > MAX_PATH_LEN {
        bail!("argument longer than {} bytes", MAX_PATH_LEN);
    }
    Ok(value)
}

fn handle_arg(args: &[&str], usage: &str) -> Result<HandleId> {
    let text = arg(args, 0, usage)?;
    let id = text
        .parse::<u64>()
        .with_context(|| format!("invalid handle '{}'", text))?;
    Ok(HandleId(id))
}

fn optional_mode(text: Option<&&str>, default: Mode) -> Result<Mode> {
    match text {
        Some(text) => Ok(Mode::parse_octal(text)?),
        None => Ok(default),
    }
}

fn timestamp(secs: i64) -> String {
    chrono::DateTime::from_timestamp(secs, 0)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::sync::Arc;
    use tinyext::blockdev::MemoryBlockDevice;
    use tinyext::{FormatOptions, FsConfig};

    fn run_script(script: &str) -> (String, FileSystem) {
        let options = FormatOptions::default();
        let device = Arc::new(MemoryBlockDevice::new(options.block_count, options.block_size));
        let fs = FileSystem::format(device, &options, FsConfig::default()).unwrap();

        let mut shell = Shell::new(
            fs,
            UserTable::default(),
            Cursor::new(script.as_bytes().to_vec()),
            Vec::new(),
        );
        shell.run().unwrap();
        let Shell { fs, out, .. } = shell;
        (String::from_utf8(out).unwrap(), fs)
    }

    #[test]
    fn test_login_and_quit() {
        let (out, _) = run_script("root\nwrong\nroot\nroot\npwd\nquit\n");
        assert!(out.contains("Login incorrect"));
        assert!(out.contains("Welcome, root!"));
        assert!(out.contains("[root@tinyext /]# "));
        assert!(out.ends_with("Good Bye!\n"));
    }

    #[test]
    fn test_quit_at_login_prompt() {
        let (out, _) = run_script("exit\n");
        assert_eq!(out, "username: Good Bye!\n");
    }

    #[test]
    fn test_file_workflow() {
        let script = "root\nroot\n\
            mkdir docs\n\
            cd docs\n\
            touch note\n\
            open note\n\
            write 1 hello world\n\
            seek 1 0\n\
            read 1\n\
            close 1\n\
            ls -l\n\
            quit\n";
        let (out, fs) = run_script(script);
        assert!(out.contains("[root@tinyext /docs]# "));
        assert!(out.contains("handle 1"));
        assert!(out.contains("wrote 11 bytes"));
        assert!(out.contains("hello world\n"));
        assert!(out.contains("-rw-r--r--"));
        assert!(fs.handles().is_empty());
    }

    #[test]
    fn test_errors_do_not_end_the_session() {
        let script = "root\nroot\n\
            cd nowhere\n\
            mkdir a\n\
            mkdir a\n\
            bogus\n\
            chmod a 999\n\
            pwd\n\
            quit\n";
        let (out, _) = run_script(script);
        assert!(out.contains("error: "));
        assert!(out.contains("Unknown command 'bogus'"));
        assert!(out.contains("Commands:"));
        // The session survived every failure
        assert!(out.contains("/\n[root@tinyext /]# "));
    }

    #[test]
    fn test_format_confirmation() {
        let script = "root\nroot\n\
            mkdir keep\n\
            format\n\
            n\n\
            ls\n\
            format\n\
            y\n\
            ls\n\
            quit\n";
        let (out, fs) = run_script(script);
        assert!(out.contains("Format Disk canceled"));
        assert!(out.contains("keep/"));
        assert!(out.contains("Formatting..."));
        assert_eq!(fs.statfs().free_inodes, fs.statfs().total_inodes - 1);
    }

    #[test]
    fn test_handles_closed_on_logout() {
        let script = "root\nroot\n\
            touch f\n\
            open f r\n\
            logout\n\
            guest\nguest\n\
            rm f\n\
            ckdisk\n\
            quit\n";
        let (out, fs) = run_script(script);
        assert!(out.contains("Welcome, guest!"));
        assert!(out.contains("Disk is consistent"));
        assert!(fs.handles().is_empty());
    }

    #[test]
    fn test_ckdisk_json() {
        let (out, _) = run_script("root\nroot\nckdisk --json\nquit\n");
        assert!(out.contains("\"violations\": []"));
    }
}
