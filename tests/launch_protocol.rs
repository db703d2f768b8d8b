//! Integration tests for the supervisor/task control protocol
//!
//! The pid/ack/error sequence runs here over a real socket pair between
//! two threads; namespace-entering launches need root and are #[ignore]d.

use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use portod::errors::{Error, ErrorKind};
use portod::execution::ControlSocket;

fn my_pid() -> i32 {
    std::process::id() as i32
}

/// The supervisor side of a successful launch, as one function
fn supervise(master: &ControlSocket) -> Result<(i32, i32, i32), Error> {
    master.set_recv_timeout(Duration::from_secs(5))?;

    let (wait_pid, _) = master.recv_pid()?;
    master.send_zero()?;

    let (task_pid, task_vpid) = master.recv_pid()?;
    master.send_zero()?;

    let error = master.recv_error()?;
    if !error.is_success() {
        return Err(error);
    }
    Ok((wait_pid, task_pid, task_vpid))
}

#[test]
fn successful_launch_flow() {
    let (master, sock) = ControlSocket::pair().unwrap();
    let (events_tx, events_rx) = mpsc::channel::<&'static str>();

    let task = thread::spawn(move || {
        sock.send_pid(my_pid()).unwrap();
        sock.recv_zero().unwrap();
        events_tx.send("wpid-acked").unwrap();

        sock.send_pid(my_pid()).unwrap();
        sock.recv_zero().unwrap();
        events_tx.send("vpid-acked").unwrap();

        sock.send_error(&Error::success()).unwrap();
        events_tx.send("done").unwrap();
    });

    let (wait_pid, task_pid, task_vpid) = supervise(&master).unwrap();
    task.join().unwrap();

    assert_eq!(wait_pid, my_pid());
    assert_eq!(task_pid, my_pid());
    assert_eq!(task_vpid, my_pid());

    // stage 0 completed before stage 1, which completed before stage 2
    let order: Vec<&str> = events_rx.try_iter().collect();
    assert_eq!(order, vec!["wpid-acked", "vpid-acked", "done"]);
}

#[test]
fn failed_launch_flushes_pid_slots_and_reports_the_error() {
    let (master, sock) = ControlSocket::pair().unwrap();

    // the child fails before reporting any pid: it fills both slots with
    // its own pid and sends the error
    let task = thread::spawn(move || {
        let error = Error::from_errno(ErrorKind::Unknown, libc::ESRCH, "setns(net)");
        for _ in 0..2 {
            sock.send_pid(my_pid()).unwrap();
            sock.recv_zero().unwrap();
        }
        sock.send_error(&error).unwrap();
    });

    let err = supervise(&master).unwrap_err();
    task.join().unwrap();

    assert_eq!(err.kind, ErrorKind::Unknown);
    assert_eq!(err.errno, libc::ESRCH);
    assert!(err.text.starts_with("setns(net)"));
}

#[test]
fn supervisor_times_out_on_a_silent_task() {
    let (master, sock) = ControlSocket::pair().unwrap();
    master.set_recv_timeout(Duration::from_millis(50)).unwrap();

    let err = master.recv_pid().unwrap_err();
    assert!(err.errno == libc::EAGAIN || err.errno == libc::EWOULDBLOCK);
    drop(sock);
}

#[test]
fn triple_fork_vpid_forwarding() {
    // supervisor <- master/sock -> "intermediary" <- master2/sock2 -> "task"
    let (master, sock) = ControlSocket::pair().unwrap();
    let (master2, sock2) = ControlSocket::pair().unwrap();

    let task = thread::spawn(move || {
        sock2.send_pid(my_pid()).unwrap();
        sock2.recv_zero().unwrap();
    });

    let intermediary = thread::spawn(move || {
        sock.send_pid(my_pid()).unwrap();
        sock.recv_zero().unwrap();

        // forward the task's pid upstream, then ack downstream
        let (task_pid, _) = master2.recv_pid().unwrap();
        sock.send_pid(task_pid).unwrap();
        master2.send_zero().unwrap();

        sock.recv_zero().unwrap();
        sock.send_error(&Error::success()).unwrap();
    });

    let (wait_pid, task_pid, _) = supervise(&master).unwrap();
    task.join().unwrap();
    intermediary.join().unwrap();

    assert_eq!(wait_pid, my_pid());
    assert_eq!(task_pid, my_pid());
}
