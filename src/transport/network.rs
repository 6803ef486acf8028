//! Establishing one TCP connection between every pair of worker processes.
//!
//! Each process connects to every process with a lower index and accepts connections from every
//! process with a higher index. A connecting process announces itself with a magic number
//! followed by its index.

use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread::{self, sleep};
use std::time::Duration;

const HANDSHAKE_MAGIC: u64 = 0xc2f1_daee_6b7a_41c5;

/// Connects to every peer, binding `addresses[my_index]` for incoming connections.
///
/// The result holds one stream per process, `None` at `my_index`.
pub fn create_sockets(addresses: Vec<String>, my_index: usize, noisy: bool) -> io::Result<Vec<Option<TcpStream>>> {
    let listener = TcpListener::bind(&addresses[my_index][..])?;
    create_sockets_with_listener(listener, addresses, my_index, noisy)
}

/// As [`create_sockets`], with an already bound listener.
pub fn create_sockets_with_listener(listener: TcpListener, addresses: Vec<String>, my_index: usize, noisy: bool) -> io::Result<Vec<Option<TcpStream>>> {
    let hosts1 = Arc::new(addresses);
    let hosts2 = hosts1.clone();

    let start_task = thread::spawn(move || start_connections(hosts1, my_index, noisy));
    let await_task = thread::spawn(move || await_connections(listener, hosts2, my_index, noisy));

    let mut results = start_task.join().map_err(|_| io::Error::new(io::ErrorKind::Other, "connecting thread panicked"))??;
    results.push(None);
    let to_extend = await_task.join().map_err(|_| io::Error::new(io::ErrorKind::Other, "accepting thread panicked"))??;
    results.extend(to_extend.into_iter());

    if noisy { println!("worker {}:\tinitialization complete", my_index) }

    Ok(results)
}

fn start_connections(addresses: Arc<Vec<String>>, my_index: usize, noisy: bool) -> io::Result<Vec<Option<TcpStream>>> {
    let mut results = Vec::with_capacity(my_index);
    for (index, address) in addresses.iter().take(my_index).enumerate() {
        let stream = loop {
            match TcpStream::connect(&address[..]) {
                Ok(mut stream) => {
                    stream.set_nodelay(true)?;
                    stream.write_all(&HANDSHAKE_MAGIC.to_le_bytes())?;
                    stream.write_all(&(my_index as u64).to_le_bytes())?;
                    if noisy { println!("worker {}:\tconnection to worker {}", my_index, index); }
                    break stream;
                },
                Err(error) => {
                    println!("worker {}:\terror connecting to worker {}: {}; retrying", my_index, index, error);
                    sleep(Duration::from_secs(1));
                },
            }
        };
        results.push(Some(stream));
    }
    Ok(results)
}

fn await_connections(listener: TcpListener, addresses: Arc<Vec<String>>, my_index: usize, noisy: bool) -> io::Result<Vec<Option<TcpStream>>> {
    let expected = addresses.len() - my_index - 1;
    let mut results: Vec<Option<TcpStream>> = (0 .. expected).map(|_| None).collect();

    for _ in 0 .. expected {
        let mut stream = listener.accept()?.0;
        stream.set_nodelay(true)?;
        let mut word = [0u8; 8];
        stream.read_exact(&mut word)?;
        if u64::from_le_bytes(word) != HANDSHAKE_MAGIC {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "received incorrect handshake"));
        }
        stream.read_exact(&mut word)?;
        let identifier = u64::from_le_bytes(word) as usize;
        if identifier <= my_index || identifier >= addresses.len() {
            return Err(io::Error::new(io::ErrorKind::InvalidData, format!("unexpected worker index {}", identifier)));
        }
        results[identifier - my_index - 1] = Some(stream);
        if noisy { println!("worker {}:\tconnection from worker {}", my_index, identifier); }
    }

    Ok(results)
}
