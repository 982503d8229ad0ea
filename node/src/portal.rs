pub const PORTAL_PATHS: [&str; 7] = [
    "/",
    "/generate_204",
    "/gen_204",
    "/hotspot-detect.html",
    "/connecttest.txt",
    "/ncsi.txt",
    "/fwlink",
];

pub const PORTAL_API_PATH: &str = "/api/portal";
pub const UPDATE_PATH: &str = "/update";
pub const UPDATE_PASSWORD_HEADER: &str = "X-Update-Password";

pub const PORTAL_HTML: &str = r#"<!doctype html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <meta name="viewport" content="width=device-width, initial-scale=1">
  <title>Uplink Node Setup</title>
  <style>
    body{font-family:Arial,sans-serif;max-width:560px;margin:2rem auto;padding:0 1rem;color:#111}
    h1{margin:0 0 .5rem}.card{border:1px solid #ddd;border-radius:10px;padding:1rem;margin-bottom:1rem}
    label{display:block;margin:.5rem 0 .2rem}
    input{width:100%;padding:.5rem;box-sizing:border-box}
    .muted{color:#555}.ok{color:#106010}.err{color:#a00000}
    button{padding:.55rem .9rem;margin-top:.8rem}
  </style>
</head>
<body>
  <h1>Uplink Node Setup</h1>
  <p class="muted">Access point: <code id="apName">--</code></p>

  <div class="card">
    <h2>WiFi</h2>
    <label>SSID</label><input id="ssid" type="text" maxlength="32">
    <label>Password</label><input id="password" type="password" maxlength="64">
  </div>

  <div class="card">
    <h2>Broker</h2>
    <div id="fields"></div>
    <button id="save">Save</button>
  </div>

  <p id="status" class="muted"></p>

  <script>
    const q=(id)=>document.getElementById(id);

    async function api(path,opt){
      const r=await fetch(path,opt);let b={};
      try{b=await r.json();}catch(_){}
      if(!r.ok)throw new Error(b.error||('Request failed: '+r.status));
      return b;
    }

    async function load(){
      const d=await api('/api/portal');
      q('apName').textContent=d.apName;
      q('ssid').value=d.ssid||'';
      const host=q('fields');
      for(const f of d.fields){
        const label=document.createElement('label');label.textContent=f.label;
        const input=document.createElement('input');
        input.id=f.id;input.type='text';input.maxLength=f.maxLength-1;input.value=d[f.id]||'';
        host.appendChild(label);host.appendChild(input);
      }
    }

    q('save').addEventListener('click', async ()=>{
      q('status').className='muted'; q('status').textContent='Saving...';
      try{
        const payload={
          ssid:q('ssid').value.trim(),
          password:q('password').value||undefined,
          server:q('server').value.trim(),
          port:q('port').value.trim(),
        };
        await api('/api/portal',{method:'POST',headers:{'content-type':'application/json'},body:JSON.stringify(payload)});
        q('status').className='ok'; q('status').textContent='Saved. The node is joining the network.';
      }catch(err){q('status').className='err'; q('status').textContent=err.message;}
    });

    load().catch((err)=>{q('status').className='err';q('status').textContent=err.message;});
  </script>
</body>
</html>
"#;
