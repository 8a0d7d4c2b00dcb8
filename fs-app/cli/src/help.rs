pub const HELP: &str = "\
Commands:
  cd <path>                   change the working directory
  pwd                         print the working directory
  mkdir <path> [mode]         create a directory (mode in octal, default 755)
  touch <path> [mode]         create an empty file (default 644)
  rmdir <path>                remove an empty directory
  rm <path>                   remove a file or a directory tree
  open <path> [r|w|rw]        open a file and print its handle (default rw)
  close <handle|path>         close a handle, or every handle on a file
  read <handle> [len]         read from the handle's offset (default: to end)
  write <handle> <text...>    write text at the handle's offset
  seek <handle> <offset>      move the handle's offset
  ls [-l] [path]              list a directory
  stat <path>                 show inode details
  chmod <path> <mode>         set permission bits (octal, e.g. 640)
  df                          show disk usage
  format                      wipe the disk (asks for confirmation)
  ckdisk [--json]             check filesystem consistency
  whoami                      show the logged-in user
  logout                      close this session and log in again
  help, h                     show this text
  quit, exit                  leave the shell
";
