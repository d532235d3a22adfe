use keel::{Kernel, KernelError, config::SystemConfigurationBuilder, kernel};
use std::sync::Arc;

fn boot() -> Arc<Kernel> {
    Kernel::boot(SystemConfigurationBuilder::new().quiet(true).build()).unwrap()
}

#[test]
fn create_open_read_write() {
    boot()
        .run(|| {
            let kernel = kernel();
            let fs = kernel.fs();
            fs.create("hello", 8).unwrap();
            let mut file = fs.open("hello").unwrap();
            assert_eq!(file.length(), 8);
            assert_eq!(file.write(b"abc"), 3);
            assert_eq!(file.tell(), 3);
            // Files never grow.
            assert_eq!(file.write(b"defghijk"), 5);
            file.seek(0);
            let mut buf = [0u8; 16];
            assert_eq!(file.read(&mut buf), 8);
            assert_eq!(&buf[..8], b"abcdefgh");
            assert_eq!(file.read(&mut buf), 0);
            file.close();
        })
        .unwrap();
}

#[test]
fn create_errors() {
    boot()
        .run(|| {
            let kernel = kernel();
            let fs = kernel.fs();
            assert_eq!(fs.create("", 0), Err(KernelError::InvalidArgument));
            assert_eq!(
                fs.create("fifteen-chars-x", 0),
                Err(KernelError::NameTooLong)
            );
            assert_eq!(fs.create("fourteen-chars", 0), Ok(()));
            assert_eq!(fs.create("fourteen-chars", 0), Err(KernelError::FileExist));
            assert!(matches!(fs.open("missing"), Err(KernelError::NoSuchEntry)));
            assert_eq!(fs.remove("missing"), Err(KernelError::NoSuchEntry));
        })
        .unwrap();
}

#[test]
fn handles_have_independent_positions() {
    boot()
        .run(|| {
            let kernel = kernel();
            let fs = kernel.fs();
            fs.install("data", b"0123456789").unwrap();
            let mut a = fs.open("data").unwrap();
            let mut b = a.reopen();
            assert!(a.same_file(&b));
            let mut buf = [0u8; 4];
            a.read(&mut buf);
            assert_eq!(&buf, b"0123");
            b.read(&mut buf);
            assert_eq!(&buf, b"0123");
            assert_eq!(a.read_at(&mut buf, 8), 2);
            assert_eq!(&buf[..2], b"89");
            assert_eq!(a.tell(), 4);
        })
        .unwrap();
}

#[test]
fn removed_file_stays_usable_while_open() {
    boot()
        .run(|| {
            let kernel = kernel();
            let fs = kernel.fs();
            fs.install("doomed", b"still here").unwrap();
            let mut file = fs.open("doomed").unwrap();
            fs.remove("doomed").unwrap();
            assert!(!fs.exists("doomed"));
            assert!(fs.open("doomed").is_err());
            let mut buf = [0u8; 10];
            assert_eq!(file.read(&mut buf), 10);
            assert_eq!(&buf, b"still here");
            // The name is free again.
            fs.create("doomed", 1).unwrap();
        })
        .unwrap();
}

#[test]
fn write_denial_lasts_until_close() {
    boot()
        .run(|| {
            let kernel = kernel();
            let fs = kernel.fs();
            fs.install("exe", b"code").unwrap();
            let mut running = fs.open("exe").unwrap();
            running.deny_write();
            let mut writer = fs.open("exe").unwrap();
            assert_eq!(writer.write(b"XXXX"), 0);
            assert_eq!(writer.write_at(b"XXXX", 0), 0);
            running.close();
            assert_eq!(writer.write(b"data"), 4);

            let mut again = fs.open("exe").unwrap();
            again.deny_write();
            drop(again);
            assert_eq!(writer.write_at(b"more", 0), 4);
        })
        .unwrap();
}
